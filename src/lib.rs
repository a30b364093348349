//! A PowerPC ELF object linker that emits loadable binary patch modules
//! ("Kamek" binaries) for a game executable: a miniature static linker
//! plus a set of runtime-applicable commands and the formats they can be
//! packed into.

pub mod address_mapper;
pub mod commands;
pub mod dol;
pub mod elf_collect;
pub mod error;
pub mod externals;
pub mod hooks;
pub mod kamek;
pub mod linker;
pub mod reloc;
pub mod symbols;
pub mod version_map;
pub mod word;

pub use address_mapper::AddressMapper;
pub use dol::DolFile;
pub use error::{Error, Result};
pub use externals::Externals;
pub use kamek::KamekBinary;
pub use linker::Linker;
pub use version_map::VersionMap;
pub use word::{Kind, Word};
