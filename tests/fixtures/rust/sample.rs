/// A position in a repository's history
pub struct Cursor {
    pub commit: String,
    pub height: u32,
}

/// Trailing zero bits of `n`
pub fn ruler(n: u32) -> u32 {
    if n == 0 { 0 } else { n.trailing_zeros() }
}

fn helper() -> bool {
    ruler(4) == 2
}

pub enum Change {
    Added(String),
    Deleted(String),
    Unchanged,
}

pub trait Visible {
    fn visible_at(&self, height: u32) -> bool;
    fn describe(&self) -> String;
}

impl Visible for Change {
    fn visible_at(&self, _height: u32) -> bool {
        !matches!(self, Change::Deleted(_))
    }

    fn describe(&self) -> String {
        String::new()
    }
}

impl Change {
    pub fn path(&self) -> Option<&str> {
        match self {
            Change::Added(p) | Change::Deleted(p) => Some(p),
            Change::Unchanged => None,
        }
    }
}

pub const MAX_HOPS: usize = 64;

pub static DEFAULT_BRANCH: &str = "main";

pub type Result<T> = std::result::Result<T, String>;

pub mod utils {
    pub fn clamp(val: u32, min: u32, max: u32) -> u32 {
        val.max(min).min(max)
    }
}
