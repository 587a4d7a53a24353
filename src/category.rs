use std::fmt;

/// Process phases a frame can be labeled with. `Null` is the "no event" label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Null,
    FornoEnchendo,
    SinterizacaoAcontecendo,
    DespejoAcontecendo,
    PanelaVoltandoPosicaoNormal,
    FornoVazio,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Null,
        Category::FornoEnchendo,
        Category::SinterizacaoAcontecendo,
        Category::DespejoAcontecendo,
        Category::PanelaVoltandoPosicaoNormal,
        Category::FornoVazio,
    ];

    /// Key used both on the keyboard and as `category_id` in the store.
    pub fn id(self) -> char {
        match self {
            Category::Null => '0',
            Category::FornoEnchendo => '1',
            Category::SinterizacaoAcontecendo => '2',
            Category::DespejoAcontecendo => '3',
            Category::PanelaVoltandoPosicaoNormal => '4',
            Category::FornoVazio => '5',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Null => "null",
            Category::FornoEnchendo => "forno_enchendo",
            Category::SinterizacaoAcontecendo => "sinterizacao_acontecendo",
            Category::DespejoAcontecendo => "despejo_acontecendo",
            Category::PanelaVoltandoPosicaoNormal => "panela_voltando_posicao_normal",
            Category::FornoVazio => "forno_vazio",
        }
    }

    pub fn from_id(id: char) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn from_name(name: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn is_null(self) -> bool {
        self == Category::Null
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finer marker within a non-null category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subphase {
    Inicio,
    Meio,
    Fim,
}

impl Subphase {
    pub const ALL: [Subphase; 3] = [Subphase::Inicio, Subphase::Meio, Subphase::Fim];

    pub fn key(self) -> char {
        match self {
            Subphase::Inicio => 'i',
            Subphase::Meio => 'm',
            Subphase::Fim => 'f',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Subphase::Inicio => "inicio",
            Subphase::Meio => "meio",
            Subphase::Fim => "fim",
        }
    }

    pub fn from_key(key: char) -> Option<Subphase> {
        let key = key.to_ascii_lowercase();
        Subphase::ALL.into_iter().find(|s| s.key() == key)
    }

    pub fn from_name(name: &str) -> Option<Subphase> {
        Subphase::ALL.into_iter().find(|s| s.name() == name)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Subphase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
