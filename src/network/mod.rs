pub mod datapath;
pub mod ip;
pub mod ipc;
pub mod transport;
