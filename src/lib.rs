//! A small pedagogical kernel core.
//!
//! Five pieces, wired together behind one lock (`proc::Kernel`):
//! wait queues and a cooperative scheduler (`sync`), process and thread
//! lifecycle (`proc`), a copy-on-write memory-object chain and address-space
//! map (`vm`), a VFS namespace of vnodes and open files (`vfs`), and the
//! hardware seam both of the above are built against (`hal`). `fs::ramfs`
//! is the one concrete filesystem driver mounted at boot.
//!
//! Real hardware — physical frame allocation, page tables, interrupt/trap
//! dispatch, and an actual instruction stream to page-fault against — is out
//! of scope; `hal::TestPageTable` stands in for all of it, the same way the
//! teacher's `arch` module is swappable per target.

pub mod error;
pub mod fs;
pub mod hal;
pub mod param;
pub mod proc;
pub mod sync;
pub mod vfs;
pub mod vm;

pub use error::{KError, KResult};
pub use proc::{Kernel, Pid};
