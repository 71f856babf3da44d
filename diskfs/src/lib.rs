//! A fixed-block filesystem core: a bounded write-back buffer cache
//! under an indexed inode engine.
//!
//! The crate covers the layer between a raw sector device and a
//! directory/path layer: sectors are cached in at most 64 resident
//! slots with pin counts and second-chance eviction, and files are
//! mapped through direct, singly-indirect, and doubly-indirect
//! pointers with dynamic zero-filled growth. Directory structure,
//! path resolution, and the on-disk free map live above and beside
//! this crate and are consumed through traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bio;
pub mod dev;
pub mod freemap;
pub mod fs;
pub mod param;

use core::result;

pub type Result<T> = result::Result<T, &'static str>;

pub use bio::{Block, Cache};
pub use dev::{BlockDevice, MemDisk};
pub use freemap::{FreeMap, SectorMap};
pub use fs::{Fs, Handle, Inode};
