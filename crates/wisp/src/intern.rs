//! Interning for a compiled program's name pool.
//!
//! Names referenced by `ATTR`, `SETFIELD`, `PREDECLARED` and `UNIVERSAL`
//! opcodes are stored once here and addressed by index, so the bytecode
//! only ever carries a small integer for what would otherwise be a
//! repeated string compare.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Index into a [`Program`](crate::bytecode::Program)'s name pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameId(pub u32);

impl NameId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Builds a deduplicated pool of interned strings during compilation.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<String>,
    index: AHashMap<String, NameId>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, returning its (possibly pre-existing) id.
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = NameId(u32::try_from(self.strings.len()).expect("name pool exceeds u32::MAX entries"));
        self.strings.push(name.to_owned());
        self.index.insert(name.to_owned(), id);
        id
    }

    #[must_use]
    pub fn finish(self) -> NamePool {
        NamePool { strings: self.strings }
    }
}

/// The finished, read-only name pool carried by a compiled `Program`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamePool {
    strings: Vec<String>,
}

impl NamePool {
    #[must_use]
    pub fn get(&self, id: NameId) -> &str {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
