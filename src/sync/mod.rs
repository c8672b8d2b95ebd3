//! Component I: migratable synchronization primitives. Each one's state is
//! small and explicit enough to snapshot/restore across a migration (spec
//! §4.I); none of them assume OS-thread identity, since a proclet's threads
//! are Tokio tasks that can be rescheduled on a different node entirely.
pub mod condvar;
pub mod cpu_load;
pub mod mutex;
pub mod rcu;
pub mod rwlock;

pub use condvar::ProcletCondVar;
pub use cpu_load::CpuLoad;
pub use mutex::ProcletMutex;
pub use rcu::RcuLock;
pub use rwlock::ProcletRwLock;
