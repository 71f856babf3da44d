use core::time::Duration;

/// Bytes per device sector. Every persistent structure is sector sized.
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on resident buffer-cache slots.
pub const NSLOT: usize = 64;

/// Pause between passes of the periodic write-back loop.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
