pub mod block_pool;
pub(crate) mod cell;
pub mod chain;
pub(crate) mod loom_tests;
pub mod rwlock;
pub mod stack;
pub mod stats;
pub mod threading;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
