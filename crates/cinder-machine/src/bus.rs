//! Device registry and physical memory routing.
//!
//! Devices are shared `Rc<RefCell<_>>` handles: the registry owns one clone
//! for interrupt dispatch and the memory router owns another for region
//! routing. A device borrows CPU state only for the duration of a single
//! service invocation and must not touch its own memory region from inside
//! that handler (no re-entrancy).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use cinder_cpu::mem::{Bus, MEM_SIZE};
use cinder_cpu::{CpuState, FlatMemory};
use uuid::Uuid;

use crate::clock::Scheduler;
use crate::MachineError;

/// Registry key for an attached device: a random 128-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(Uuid);

impl DeviceId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// An interrupt service a device claims: `vector` plus the AH selector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub vector: u8,
    pub selector: u8,
}

/// Borrowed machine state handed to a device for one service invocation.
pub struct DeviceCtx<'a> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut MemoryRouter,
    pub sched: &'a mut Scheduler,
}

pub trait Device {
    fn name(&self) -> &'static str;

    /// Linear address range this device serves, if any.
    fn memory_range(&self) -> Option<Range<u32>> {
        None
    }

    /// `(vector, AH)` services this device claims on the interrupt bus.
    fn services(&self) -> Vec<ServiceKey> {
        Vec::new()
    }

    fn handle_service(&mut self, _key: ServiceKey, _ctx: &mut DeviceCtx<'_>) {}

    /// Read one byte at `offset` into the device's memory range.
    fn mem_read(&mut self, _offset: u32) -> u8 {
        0xFF
    }

    /// Write one byte at `offset` into the device's memory range.
    fn mem_write(&mut self, _offset: u32, _value: u8) {}
}

pub type SharedDevice = Rc<RefCell<dyn Device>>;

struct DeviceEntry {
    id: DeviceId,
    device: SharedDevice,
    range: Option<Range<u32>>,
    services: Vec<ServiceKey>,
}

/// Ordered device registry with `(vector, selector)` dispatch.
#[derive(Default)]
pub struct DeviceBus {
    entries: Vec<DeviceEntry>,
    services: HashMap<ServiceKey, DeviceId>,
}

impl DeviceBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, validating that its memory range is disjoint from
    /// every attached device and that none of its `(vector, selector)`
    /// services is already claimed.
    pub fn attach(&mut self, device: SharedDevice) -> Result<DeviceId, MachineError> {
        let (name, range, services) = {
            let dev = device.borrow();
            (dev.name(), dev.memory_range(), dev.services())
        };

        if let Some(range) = &range {
            for entry in &self.entries {
                if let Some(existing) = &entry.range {
                    if range.start < existing.end && existing.start < range.end {
                        return Err(MachineError::DeviceRegistrationConflict(format!(
                            "{name}: memory range {range:#x?} overlaps {}",
                            entry.id
                        )));
                    }
                }
            }
        }
        for key in &services {
            if self.services.contains_key(key) {
                return Err(MachineError::DeviceRegistrationConflict(format!(
                    "{name}: interrupt {:#04x}/AH={:#04x} already registered",
                    key.vector, key.selector
                )));
            }
        }

        let id = DeviceId::new();
        for key in &services {
            self.services.insert(*key, id);
        }
        self.entries.push(DeviceEntry {
            id,
            device,
            range,
            services,
        });
        Ok(id)
    }

    pub fn detach(&mut self, id: DeviceId) -> Result<(), MachineError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(MachineError::UnknownDevice(id))?;
        let entry = self.entries.remove(idx);
        for key in &entry.services {
            self.services.remove(key);
        }
        Ok(())
    }

    /// The device claiming `(vector, AH)`, if any. Registered services shadow
    /// the interrupt vector table.
    pub fn service_handler(&self, vector: u8, selector: u8) -> Option<SharedDevice> {
        let id = self.services.get(&ServiceKey { vector, selector })?;
        self.entries
            .iter()
            .find(|e| e.id == *id)
            .map(|e| e.device.clone())
    }

    /// Memory regions for the router, in attach order (first match serves).
    pub fn memory_regions(&self) -> Vec<(Range<u32>, SharedDevice)> {
        self.entries
            .iter()
            .filter_map(|e| e.range.clone().map(|r| (r, e.device.clone())))
            .collect()
    }
}

/// Guest physical memory: flat RAM with device regions layered in front.
///
/// The first matching device region serves a byte; everything else is RAM.
pub struct MemoryRouter {
    pub ram: FlatMemory,
    regions: Vec<(Range<u32>, SharedDevice)>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self {
            ram: FlatMemory::new(),
            regions: Vec::new(),
        }
    }

    pub fn set_regions(&mut self, regions: Vec<(Range<u32>, SharedDevice)>) {
        self.regions = regions;
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MemoryRouter {
    fn read_u8(&mut self, addr: u32) -> u8 {
        let addr = addr & (MEM_SIZE - 1);
        for (range, device) in &self.regions {
            if range.contains(&addr) {
                return device.borrow_mut().mem_read(addr - range.start);
            }
        }
        self.ram.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        let addr = addr & (MEM_SIZE - 1);
        for (range, device) in &self.regions {
            if range.contains(&addr) {
                device.borrow_mut().mem_write(addr - range.start, value);
                return;
            }
        }
        self.ram.write_u8(addr, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        range: Range<u32>,
        services: Vec<ServiceKey>,
        bytes: Vec<u8>,
    }

    impl Probe {
        fn new(range: Range<u32>, services: Vec<ServiceKey>) -> Rc<RefCell<Self>> {
            let len = (range.end - range.start) as usize;
            Rc::new(RefCell::new(Self {
                range,
                services,
                bytes: vec![0; len],
            }))
        }
    }

    impl Device for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn memory_range(&self) -> Option<Range<u32>> {
            Some(self.range.clone())
        }

        fn services(&self) -> Vec<ServiceKey> {
            self.services.clone()
        }

        fn mem_read(&mut self, offset: u32) -> u8 {
            self.bytes[offset as usize]
        }

        fn mem_write(&mut self, offset: u32, value: u8) {
            self.bytes[offset as usize] = value;
        }
    }

    #[test]
    fn overlapping_memory_ranges_are_rejected() {
        let mut bus = DeviceBus::new();
        bus.attach(Probe::new(0x1000..0x2000, vec![])).unwrap();
        let err = bus.attach(Probe::new(0x1800..0x2800, vec![])).unwrap_err();
        assert!(matches!(err, MachineError::DeviceRegistrationConflict(_)));
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let key = ServiceKey {
            vector: 0x10,
            selector: 0x0E,
        };
        let mut bus = DeviceBus::new();
        bus.attach(Probe::new(0x1000..0x1100, vec![key])).unwrap();
        let err = bus.attach(Probe::new(0x2000..0x2100, vec![key])).unwrap_err();
        assert!(matches!(err, MachineError::DeviceRegistrationConflict(_)));
    }

    #[test]
    fn detach_releases_services_and_id() {
        let key = ServiceKey {
            vector: 0x10,
            selector: 0x0E,
        };
        let mut bus = DeviceBus::new();
        let id = bus.attach(Probe::new(0x1000..0x1100, vec![key])).unwrap();
        bus.detach(id).unwrap();
        assert!(bus.service_handler(0x10, 0x0E).is_none());
        assert!(bus.attach(Probe::new(0x1000..0x1100, vec![key])).is_ok());
    }

    #[test]
    fn router_prefers_device_region_over_ram() {
        let mut bus = DeviceBus::new();
        let probe = Probe::new(0x1000..0x1010, vec![]);
        bus.attach(probe.clone()).unwrap();

        let mut router = MemoryRouter::new();
        router.ram.write_u8(0x0FFF, 0x11);
        router.ram.write_u8(0x1010, 0x22);
        router.set_regions(bus.memory_regions());

        router.write_u8(0x1004, 0xAB);
        assert_eq!(router.read_u8(0x1004), 0xAB);
        // The device write never lands in RAM.
        assert_eq!(router.ram.read_u8(0x1004), 0);
        // Bytes on either side still come from RAM.
        assert_eq!(router.read_u8(0x0FFF), 0x11);
        assert_eq!(router.read_u8(0x1010), 0x22);
    }
}
