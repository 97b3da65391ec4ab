pub mod args;
pub mod filter;
pub mod obj_pool;
pub mod packet;
pub mod pid;
pub mod pid_inst;
pub mod props;
pub(crate) mod scheduler;
pub mod session;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_util;
