//! Building blocks for [`clap`]-driven configuration of the tick store.

pub mod storage;
