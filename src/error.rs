use core::result;
use quick_error::quick_error;

quick_error! {
    /// The full error taxonomy for the linker pipeline.
    ///
    /// Every stage of the pipeline (§2 of the design doc) aborts the current
    /// link job on the first error; nothing here is recovered locally.
    #[derive(Debug)]
    pub enum Error {
        Io(err: ::std::io::Error) {
            from()
            display("{}", err)
        }
        Elf(err: goblin::error::Error) {
            from()
            display("malformed ELF object: {}", err)
        }
        Scroll(err: scroll::Error) {
            from()
            display("binary I/O error: {}", err)
        }
        /// Malformed input: a bad externs line, a structural ELF invariant
        /// violation, an unrecognized `st_shndx`, a bad version-map entry.
        InvalidData(msg: String) {
            display("invalid data: {}", msg)
        }
        /// An ELF cross-table reference (`sh_link`, `sh_info`) points at a
        /// section that does not have the expected type.
        InvalidTableLinkage(msg: String) {
            display("invalid table linkage: {}", msg)
        }
        /// The caller tried to add a module, or otherwise register an entity,
        /// that already exists.
        AlreadyExists(msg: String) {
            display("already exists: {}", msg)
        }
        /// The caller tried to link a `Linker` that was already linked.
        AlreadyLinked(msg: String) {
            display("already linked: {}", msg)
        }
        /// A semantic rule was violated: an ambiguous `Word` reached
        /// serialization, a `PatchExit` target doesn't end in `blr`, two
        /// commands target the same address, a DOL was asked to absorb a
        /// dynamically-linked module.
        InvalidOperation(msg: String) {
            display("invalid operation: {}", msg)
        }
        /// A command's address cannot be represented in the packed format
        /// (a relative address wider than 24 bits with no escape slot free).
        InvalidCommand(msg: String) {
            display("invalid command: {}", msg)
        }
        /// A relocation or hook type the linker does not implement.
        NotImplemented(msg: String) {
            display("not implemented: {}", msg)
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
