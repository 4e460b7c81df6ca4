#![forbid(unsafe_code)]

//! Minimal boot-time BIOS for the cinder machine.
//!
//! Services INT 10h (video), INT 13h (floppy disk), INT 15h (wait) and
//! INT 16h (keyboard), operating directly on the CPU register file and guest
//! memory. Asynchronous waits are expressed through [`SchedulerServices`] so
//! the firmware never blocks the host.

pub mod firmware;
pub mod video;

pub use firmware::{
    Bios, BiosConfig, BlockDevice, DiskError, DiskGeometry, SchedulerServices, SERVICES,
};
pub use video::{VideoMode, VIDEO_MODES};
