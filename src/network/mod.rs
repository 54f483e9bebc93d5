pub mod gossip;
pub mod peer;
pub mod protocol;
pub mod sync;
