#![forbid(unsafe_code)]

//! Machine assembly for the cinder emulator.
//!
//! Composes the CPU core, guest memory, the device bus and the BIOS into a
//! bootable real-mode PC. The embedder drives it cooperatively: `run()` for
//! synchronous (test) execution, `tick()` for host-loop execution, and
//! `advance_micros`/`press_key` for the asynchronous edges (INT 15h waits and
//! blocking keyboard reads), which only ever flip the pause latch, flags or
//! registers -- never execute instructions.

mod bus;
mod clock;
mod vga;

use std::cell::RefCell;
use std::rc::Rc;

use cinder_bios::{Bios, BiosConfig, BlockDevice, DiskError, SERVICES};
use cinder_cpu::mem::Bus as _;
use cinder_cpu::state::FLAG_IF;
use cinder_cpu::{interrupts, step, CpuExit, CpuState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use bus::{Device, DeviceBus, DeviceCtx, DeviceId, MemoryRouter, ServiceKey, SharedDevice};
pub use clock::{Scheduler, Wake};
pub use vga::VgaText;

const BOOT_SECTOR_SIZE: usize = 512;
const BOOT_LOAD_ADDR: u32 = 0x7C00;

/// Default instruction budget for a synchronous `run()`.
const DEFAULT_CLOCKS_BUDGET: i64 = 10_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Skip the 0x55AA boot-signature check.
    pub ignore_magic: bool,
    /// Suppress informational logs.
    pub silent: bool,
    /// Run the scheduler synchronously inside `boot` until HALTED or budget.
    pub sync: bool,
    /// Instructions per `tick()` when driven asynchronously.
    pub clocks_per_tick: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ignore_magic: false,
            silent: false,
            sync: false,
            clocks_per_tick: 5000,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("boot image is not terminated by the 0x55AA signature")]
    BootSignatureMismatch,

    #[error("device registration conflict: {0}")]
    DeviceRegistrationConflict(String),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("image write at {addr:#07x}+{len:#x} is outside guest memory")]
    ImageOutOfRange { addr: u32, len: usize },
}

/// Why the scheduler returned control to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Halted,
    Paused,
    BudgetExhausted,
}

/// Boot medium: a byte image addressed in 512-byte sectors.
pub struct SectorImage {
    bytes: Vec<u8>,
}

impl SectorImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }
}

impl BlockDevice for SectorImage {
    fn read_sector(&mut self, lba: u64, buf512: &mut [u8; 512]) -> Result<(), DiskError> {
        let start = (lba as usize) * 512;
        if start >= self.bytes.len() {
            return Err(DiskError::OutOfRange);
        }
        let end = (start + 512).min(self.bytes.len());
        buf512.fill(0);
        buf512[..end - start].copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.bytes.len().div_ceil(512) as u64
    }
}

/// The BIOS and its boot medium as one bus device.
pub struct BiosDevice {
    pub bios: Bios,
    pub disk: SectorImage,
}

impl Device for BiosDevice {
    fn name(&self) -> &'static str {
        "bios"
    }

    fn services(&self) -> Vec<ServiceKey> {
        SERVICES
            .iter()
            .map(|&(vector, selector)| ServiceKey { vector, selector })
            .collect()
    }

    fn handle_service(&mut self, key: ServiceKey, ctx: &mut DeviceCtx<'_>) {
        self.bios
            .handle_service(key.vector, ctx.cpu, ctx.mem, &mut self.disk, ctx.sched);
    }
}

pub struct Machine {
    cfg: MachineConfig,
    cpu: CpuState,
    mem: MemoryRouter,
    devices: DeviceBus,
    sched: Scheduler,
    bios: Rc<RefCell<BiosDevice>>,
    vga: Rc<RefCell<VgaText>>,
    stopped: bool,
}

impl Machine {
    pub fn new(cfg: MachineConfig) -> Self {
        let mut devices = DeviceBus::new();

        let vga = VgaText::new();
        devices
            .attach(vga.clone())
            .expect("fresh bus cannot conflict");

        let bios = Rc::new(RefCell::new(BiosDevice {
            bios: Bios::new(BiosConfig::default()),
            disk: SectorImage::empty(),
        }));
        devices
            .attach(bios.clone())
            .expect("fresh bus cannot conflict");

        let mut mem = MemoryRouter::new();
        mem.set_regions(devices.memory_regions());

        Self {
            cfg,
            cpu: CpuState::new(),
            mem,
            devices,
            sched: Scheduler::new(DEFAULT_CLOCKS_BUDGET),
            bios,
            vga,
            stopped: false,
        }
    }

    /// Load a boot image and reset the CPU to 0000:7C00.
    ///
    /// The first sector is copied to the load address; the whole image backs
    /// the BIOS floppy for INT 13h reads. In `sync` mode this also runs the
    /// scheduler until HLT, a pause, or budget exhaustion.
    pub fn boot(&mut self, image: &[u8]) -> Result<(), MachineError> {
        if !self.cfg.ignore_magic {
            if image.len() < BOOT_SECTOR_SIZE
                || image[BOOT_SECTOR_SIZE - 2] != 0x55
                || image[BOOT_SECTOR_SIZE - 1] != 0xAA
            {
                return Err(MachineError::BootSignatureMismatch);
            }
        }

        let sector = &image[..image.len().min(BOOT_SECTOR_SIZE)];
        if !self.mem.ram.load(BOOT_LOAD_ADDR, sector) {
            return Err(MachineError::ImageOutOfRange {
                addr: BOOT_LOAD_ADDR,
                len: sector.len(),
            });
        }

        let boot_drive = {
            let mut bios = self.bios.borrow_mut();
            bios.disk = SectorImage::new(image.to_vec());
            bios.bios.post(&mut self.mem);
            bios.bios.config().boot_drive
        };

        self.cpu.reset();
        self.cpu.set_sp(BOOT_LOAD_ADDR as u16);
        self.cpu.set_dl(boot_drive);
        self.sched.paused = false;
        self.sched.waiting_for_key = false;
        self.sched.clocks_budget = DEFAULT_CLOCKS_BUDGET;
        self.stopped = false;

        if !self.cfg.silent {
            info!(bytes = image.len(), "boot image loaded at 0000:7C00");
        }

        if self.cfg.sync {
            self.run();
        }
        Ok(())
    }

    /// Attach an external device (registers its memory range and services).
    pub fn attach(&mut self, device: SharedDevice) -> Result<DeviceId, MachineError> {
        let id = self.devices.attach(device)?;
        self.mem.set_regions(self.devices.memory_regions());
        Ok(id)
    }

    pub fn detach(&mut self, id: DeviceId) -> Result<(), MachineError> {
        self.devices.detach(id)?;
        self.mem.set_regions(self.devices.memory_regions());
        Ok(())
    }

    /// Run until HLT, a device pause, or budget exhaustion.
    pub fn run(&mut self) -> RunExit {
        loop {
            if self.cpu.halted {
                return RunExit::Halted;
            }
            if self.sched.paused {
                return RunExit::Paused;
            }
            if self.sched.clocks_budget <= 0 {
                return RunExit::BudgetExhausted;
            }
            self.sched.clocks_budget -= 1;
            self.step();
        }
    }

    /// Execute up to `clocks_per_tick` instructions, then yield to the host.
    pub fn tick(&mut self) -> RunExit {
        for _ in 0..self.cfg.clocks_per_tick {
            if self.cpu.halted {
                return RunExit::Halted;
            }
            if self.sched.paused {
                return RunExit::Paused;
            }
            self.step();
        }
        RunExit::BudgetExhausted
    }

    /// One fetch-decode-execute step, routing any interrupt exit.
    pub fn step(&mut self) {
        self.sched.last_instr_ip = self.cpu.ip();
        match step(&mut self.cpu, &mut self.mem) {
            Ok(CpuExit::Continue) | Ok(CpuExit::Halted) => {}
            Ok(CpuExit::Interrupt(vector)) => self.dispatch_interrupt(vector),
            Err(fault) => {
                debug!(%fault, ip = self.sched.last_instr_ip, "architectural fault");
                self.dispatch_interrupt(fault.vector());
            }
        }
    }

    /// Device-registered handlers shadow the IVT; a zero vector entry makes
    /// the interrupt a no-op that reports CF=1.
    fn dispatch_interrupt(&mut self, vector: u8) {
        let selector = self.cpu.ah();
        if let Some(device) = self.devices.service_handler(vector, selector) {
            let mut ctx = DeviceCtx {
                cpu: &mut self.cpu,
                mem: &mut self.mem,
                sched: &mut self.sched,
            };
            device
                .borrow_mut()
                .handle_service(ServiceKey { vector, selector }, &mut ctx);
            return;
        }

        let (offset, segment) = interrupts::ivt_entry(&mut self.mem, vector);
        if offset == 0 && segment == 0 {
            warn!(vector, selector, "unhandled interrupt service");
            self.cpu.set_cf(true);
            return;
        }
        interrupts::deliver(&mut self.cpu, &mut self.mem, vector);
    }

    /// Advance guest time, firing due waits. Idempotent: firing after
    /// `stop()` only flips the pause latch and CF.
    pub fn advance_micros(&mut self, delta: u64) {
        self.sched.advance_micros(delta);
        while let Some(wake) = self.sched.take_due_wake() {
            if self.sched.waiting_for_key {
                // A later blocking keyboard read owns the pause now.
                continue;
            }
            self.sched.paused = false;
            if wake.clear_carry {
                self.cpu.set_cf(false);
            }
        }
    }

    /// Deliver a keystroke (`scan << 8 | ascii`) to the BIOS buffer, waking a
    /// blocked INT 16h read.
    pub fn press_key(&mut self, key: u16) {
        self.bios.borrow_mut().bios.press_key(key);
        if self.sched.waiting_for_key {
            self.sched.waiting_for_key = false;
            self.sched.paused = false;
        }
        if self.cpu.halted && self.cpu.flag(FLAG_IF) && !self.stopped {
            self.cpu.halted = false;
        }
    }

    /// Host-side cancellation: halts the machine; pending waits stay
    /// harmless.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.cpu.halted = true;
    }

    pub fn registers(&self) -> &CpuState {
        &self.cpu
    }

    pub fn registers_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Replace the remaining instruction budget for `run()`.
    pub fn set_clocks_budget(&mut self, budget: i64) {
        self.sched.clocks_budget = budget;
    }

    pub fn is_halted(&self) -> bool {
        self.cpu.halted
    }

    pub fn is_paused(&self) -> bool {
        self.sched.paused
    }

    pub fn read_mem8(&mut self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    pub fn read_mem16(&mut self, addr: u32) -> u16 {
        self.mem.read_u16(addr)
    }

    pub fn write_mem8(&mut self, addr: u32, value: u8) {
        self.mem.write_u8(addr, value);
    }

    pub fn read_bytes(&mut self, addr: u32, len: usize) -> Vec<u8> {
        (0..len).map(|i| self.mem.read_u8(addr + i as u32)).collect()
    }

    /// `(char, attribute)` of a text cell on page 0 of the current mode.
    pub fn text_cell(&self, row: u32, col: u32) -> (u8, u8) {
        let mode = self.bios.borrow().bios.video_mode();
        self.vga
            .borrow()
            .text_cell(mode.page_size, 0, mode.cols as u32, row, col)
    }
}
