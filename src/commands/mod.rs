pub mod collect;
pub mod daemon;
pub mod push;
pub mod status;
