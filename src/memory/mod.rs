pub(crate) mod allocator;
pub(crate) mod block_info;
pub(crate) mod error;
pub(crate) mod fixed;
pub(crate) mod integration;
pub(crate) mod large;
#[cfg(not(loom))]
pub(crate) mod manager;
pub(crate) mod platform;
pub(crate) mod size_class;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
