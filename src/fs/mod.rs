//! Concrete filesystem drivers. Only an in-memory one exists; a real disk
//! filesystem would live alongside it behind the same `VnodeOps` seam.

pub mod ramfs;
