use cinder_bios::{Bios, BiosConfig, BlockDevice, DiskError, SchedulerServices};
use cinder_cpu::{Bus, CpuState, FlatMemory, Segment};

/// In-memory floppy image.
struct ImageDisk {
    bytes: Vec<u8>,
}

impl ImageDisk {
    fn new(sectors: usize) -> Self {
        let mut bytes = vec![0u8; sectors * 512];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i / 512) as u8; // each sector filled with its LBA
        }
        Self { bytes }
    }
}

impl BlockDevice for ImageDisk {
    fn read_sector(&mut self, lba: u64, buf512: &mut [u8; 512]) -> Result<(), DiskError> {
        let start = (lba as usize) * 512;
        let end = start + 512;
        if end > self.bytes.len() {
            return Err(DiskError::OutOfRange);
        }
        buf512.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.bytes.len() / 512) as u64
    }
}

#[derive(Default)]
struct NoSched;

impl SchedulerServices for NoSched {
    fn pause_for_micros(&mut self, _micros: u64) {
        panic!("unexpected pause");
    }

    fn pause_for_key(&mut self) {
        panic!("unexpected pause");
    }
}

fn call_int13(bios: &mut Bios, cpu: &mut CpuState, mem: &mut FlatMemory, disk: &mut ImageDisk) {
    bios.handle_service(0x13, cpu, mem, disk, &mut NoSched);
}

#[test]
fn reset_reports_success() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(64);

    cpu.set_ah(0x00);
    cpu.set_dl(0);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(!cpu.cf());
    assert_eq!(cpu.ah(), 0);
}

#[test]
fn read_single_sector_to_es_bx() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(64);

    cpu.set_ah(0x02);
    cpu.set_al(1); // one sector
    cpu.set_ch(0); // cylinder 0
    cpu.set_cl(1); // sector 1 (LBA 0)
    cpu.set_dh(0); // head 0
    cpu.set_dl(0); // drive 0
    cpu.set_segment(Segment::ES, 0);
    cpu.set_bx(0x7E00);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(!cpu.cf());
    assert_eq!(cpu.ah(), 0);
    for i in 0..512u32 {
        assert_eq!(mem.read_u8(0x7E00 + i), 0);
    }
}

#[test]
fn chs_decode_uses_cl_high_bits_and_heads() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    // 1.44M geometry: LBA = (cyl*2 + head)*18 + sector-1.
    let mut disk = ImageDisk::new(256);

    // Cylinder 2, head 1, sector 3 -> LBA (2*2+1)*18 + 2 = 92.
    cpu.set_ah(0x02);
    cpu.set_al(1);
    cpu.set_ch(2);
    cpu.set_cl(3);
    cpu.set_dh(1);
    cpu.set_dl(0);
    cpu.set_segment(Segment::ES, 0x1000);
    cpu.set_bx(0);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(!cpu.cf());
    assert_eq!(mem.read_u8(0x10000), 92);
}

#[test]
fn multi_sector_read_is_contiguous() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(64);

    cpu.set_ah(0x02);
    cpu.set_al(3);
    cpu.set_ch(0);
    cpu.set_cl(1);
    cpu.set_dh(0);
    cpu.set_dl(0);
    cpu.set_segment(Segment::ES, 0);
    cpu.set_bx(0x2000);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(!cpu.cf());
    assert_eq!(mem.read_u8(0x2000), 0);
    assert_eq!(mem.read_u8(0x2000 + 512), 1);
    assert_eq!(mem.read_u8(0x2000 + 1024), 2);
}

#[test]
fn read_past_end_of_image_fails_with_bb() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(4); // tiny image

    cpu.set_ah(0x02);
    cpu.set_al(1);
    cpu.set_ch(0);
    cpu.set_cl(9); // LBA 8, past the end
    cpu.set_dh(0);
    cpu.set_dl(0);
    cpu.set_segment(Segment::ES, 0);
    cpu.set_bx(0x3000);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(cpu.cf());
    assert_eq!(cpu.ah(), 0xBB);
}

#[test]
fn sector_zero_is_a_bad_command() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(64);

    cpu.set_ah(0x02);
    cpu.set_al(1);
    cpu.set_cl(0); // sectors are 1-based
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(cpu.cf());
    assert_eq!(cpu.ah(), 0x01);
}

#[test]
fn drive_parameters_report_floppy_geometry() {
    let mut bios = Bios::new(BiosConfig::default());
    let mut cpu = CpuState::new();
    let mut mem = FlatMemory::new();
    let mut disk = ImageDisk::new(64);

    cpu.set_ah(0x08);
    cpu.set_dl(0);
    call_int13(&mut bios, &mut cpu, &mut mem, &mut disk);

    assert!(!cpu.cf());
    assert_eq!(cpu.ch(), 79); // max cylinder (80 - 1)
    assert_eq!(cpu.cl() & 0x3F, 18); // sectors per track
    assert_eq!(cpu.dh(), 1); // max head
    assert_eq!(cpu.dl(), 1); // one drive
}
