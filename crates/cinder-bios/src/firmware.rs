use std::collections::VecDeque;

use cinder_cpu::mem::Bus;
use cinder_cpu::state::FLAG_ZF;
use cinder_cpu::{CpuState, Segment};
use tracing::warn;

use crate::video::{mode_by_number, VideoMode};

/// BIOS Data Area offsets the firmware keeps in sync.
const BDA_VIDEO_MODE: u32 = 0x449;
const BDA_TEXT_COLUMNS: u32 = 0x44A;
const BDA_PAGE_SIZE: u32 = 0x44C;
const BDA_CURSOR_POS: u32 = 0x450;
const BDA_ACTIVE_PAGE: u32 = 0x462;
const BDA_SHIFT_FLAGS: u32 = 0x417;

/// INT 13h status for a read that runs past the end of the medium.
const DISK_STATUS_UNDEFINED_ERROR: u8 = 0xBB;
const DISK_STATUS_BAD_COMMAND: u8 = 0x01;

pub trait BlockDevice {
    fn read_sector(&mut self, lba: u64, buf512: &mut [u8; 512]) -> Result<(), DiskError>;
    fn sector_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    OutOfRange,
    IoError,
}

/// How the firmware asks the scheduler to suspend the guest.
///
/// Handlers run to completion; a "blocking" BIOS service pauses the machine
/// and arranges to be resumed, it never spins.
pub trait SchedulerServices {
    /// Pause and schedule a wake after `micros` guest microseconds. The wake
    /// clears the pause and the carry flag (the INT 15h/86h contract).
    fn pause_for_micros(&mut self, micros: u64);

    /// Pause until a key lands in the keyboard buffer.
    fn pause_for_key(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
}

impl DiskGeometry {
    /// 1.44M floppy: 80 cylinders, 2 heads, 18 sectors per track.
    pub const FLOPPY_1440K: DiskGeometry = DiskGeometry {
        cylinders: 80,
        heads: 2,
        sectors_per_track: 18,
    };

    fn chs_to_lba(&self, cylinder: u16, head: u16, sector1: u16) -> u64 {
        ((cylinder as u64 * self.heads as u64) + head as u64) * self.sectors_per_track as u64
            + (sector1 as u64 - 1)
    }
}

#[derive(Debug, Clone)]
pub struct BiosConfig {
    pub boot_drive: u8,
    pub geometry: DiskGeometry,
}

impl Default for BiosConfig {
    fn default() -> Self {
        Self {
            boot_drive: 0x00,
            geometry: DiskGeometry::FLOPPY_1440K,
        }
    }
}

/// Every `(vector, AH)` service the BIOS registers on the device bus.
pub const SERVICES: &[(u8, u8)] = &[
    (0x10, 0x00),
    (0x10, 0x01),
    (0x10, 0x02),
    (0x10, 0x03),
    (0x10, 0x05),
    (0x10, 0x06),
    (0x10, 0x07),
    (0x10, 0x08),
    (0x10, 0x09),
    (0x10, 0x0A),
    (0x10, 0x0E),
    (0x10, 0x0F),
    (0x10, 0x11),
    (0x10, 0x13),
    (0x13, 0x00),
    (0x13, 0x02),
    (0x13, 0x08),
    (0x13, 0x15),
    (0x15, 0x86),
    (0x16, 0x00),
    (0x16, 0x01),
    (0x16, 0x02),
    (0x16, 0x10),
];

/// Boot-time firmware: text/graphics video, floppy reads, microsecond waits
/// and the keyboard buffer.
pub struct Bios {
    cfg: BiosConfig,
    mode: &'static VideoMode,
    cursor: [(u8, u8); 8], // (row, col) per page
    cursor_shape: u16,
    active_page: u8,
    text_attr: u8,
    kb_buf: VecDeque<u16>,
    shift_flags: u8,
}

impl Bios {
    pub fn new(cfg: BiosConfig) -> Self {
        Self {
            cfg,
            mode: mode_by_number(0x03).unwrap(),
            cursor: [(0, 0); 8],
            cursor_shape: 0x0607,
            active_page: 0,
            text_attr: 0x07,
            kb_buf: VecDeque::new(),
            shift_flags: 0,
        }
    }

    pub fn config(&self) -> &BiosConfig {
        &self.cfg
    }

    pub fn video_mode(&self) -> &'static VideoMode {
        self.mode
    }

    /// Queue a keystroke as `(scan_code << 8) | ascii`.
    pub fn press_key(&mut self, key: u16) {
        self.kb_buf.push_back(key);
    }

    pub fn has_key(&self) -> bool {
        !self.kb_buf.is_empty()
    }

    pub fn set_shift_flags(&mut self, flags: u8) {
        self.shift_flags = flags;
    }

    /// Initialize the video state and BDA for the default 80x25 text mode.
    pub fn post<M: Bus>(&mut self, mem: &mut M) {
        self.set_mode(mem, 0x03);
        mem.write_u8(BDA_SHIFT_FLAGS, self.shift_flags);
    }

    /// Dispatch a `(vector, AH)` service claimed via [`SERVICES`].
    pub fn handle_service<M: Bus, D: BlockDevice, S: SchedulerServices>(
        &mut self,
        vector: u8,
        cpu: &mut CpuState,
        mem: &mut M,
        disk: &mut D,
        sched: &mut S,
    ) {
        match vector {
            0x10 => self.int10(cpu, mem),
            0x13 => self.int13(cpu, mem, disk),
            0x15 => self.int15(cpu, sched),
            0x16 => self.int16(cpu, mem, sched),
            _ => {
                warn!(vector, ah = cpu.ah(), "BIOS: unregistered interrupt");
                cpu.set_cf(true);
            }
        }
    }

    // --- INT 10h: video ---------------------------------------------------

    fn int10<M: Bus>(&mut self, cpu: &mut CpuState, mem: &mut M) {
        match cpu.ah() {
            0x00 => {
                let requested = cpu.al() & 0x7F;
                if self.set_mode(mem, requested) {
                    cpu.set_cf(false);
                } else {
                    warn!(mode = requested, "INT 10h: unsupported video mode");
                    cpu.set_cf(true);
                }
            }
            0x01 => {
                // Cursor shape: CH = start scanline, CL = end scanline.
                self.cursor_shape = ((cpu.ch() as u16) << 8) | cpu.cl() as u16;
                cpu.set_cf(false);
            }
            0x02 => {
                let page = (cpu.bh() & 7) as usize;
                self.cursor[page] = (cpu.dh(), cpu.dl());
                self.sync_bda_cursor(mem, page);
                cpu.set_cf(false);
            }
            0x03 => {
                let page = (cpu.bh() & 7) as usize;
                let (row, col) = self.cursor[page];
                cpu.set_dh(row);
                cpu.set_dl(col);
                let shape = self.cursor_shape;
                cpu.set_ch((shape >> 8) as u8);
                cpu.set_cl(shape as u8);
                cpu.set_cf(false);
            }
            0x05 => {
                self.active_page = cpu.al() & 7;
                mem.write_u8(BDA_ACTIVE_PAGE, self.active_page);
                cpu.set_cf(false);
            }
            0x06 => {
                self.scroll_window(cpu, mem, true);
                cpu.set_cf(false);
            }
            0x07 => {
                self.scroll_window(cpu, mem, false);
                cpu.set_cf(false);
            }
            0x08 => {
                let page = (cpu.bh() & 7) as usize;
                let (row, col) = self.cursor[page];
                let addr = self.cell_addr(page as u8, row, col);
                let ch = mem.read_u8(addr);
                let attr = mem.read_u8(addr + 1);
                cpu.set_al(ch);
                cpu.set_ah(attr);
                cpu.set_cf(false);
            }
            0x09 => {
                // Write char + attribute CX times; the cursor does not move.
                let page = cpu.bh() & 7;
                let (ch, attr, count) = (cpu.al(), cpu.bl(), cpu.cx());
                let (row, col) = self.cursor[page as usize];
                self.write_cell_run(mem, page, row, col, ch, Some(attr), count);
                cpu.set_cf(false);
            }
            0x0A => {
                // Char only; existing attributes stay.
                let page = cpu.bh() & 7;
                let (ch, count) = (cpu.al(), cpu.cx());
                let (row, col) = self.cursor[page as usize];
                self.write_cell_run(mem, page, row, col, ch, None, count);
                cpu.set_cf(false);
            }
            0x0E => {
                let page = self.active_page;
                let ch = cpu.al();
                self.teletype(mem, page, ch);
                cpu.set_cf(false);
            }
            0x0F => {
                cpu.set_al(self.mode.number);
                cpu.set_ah(self.mode.cols as u8);
                cpu.set_bh(self.active_page);
                cpu.set_cf(false);
            }
            0x11 => {
                // Extended text modes: only the font-information query carries
                // data anybody reads at boot.
                if cpu.al() == 0x30 {
                    cpu.set_cx(16); // bytes per character
                    cpu.set_dl((self.mode.rows - 1) as u8);
                }
                cpu.set_cf(false);
            }
            0x13 => {
                self.write_string(cpu, mem);
                cpu.set_cf(false);
            }
            other => {
                warn!(ah = other, "INT 10h: unhandled function");
                cpu.set_ah(0x01);
                cpu.set_cf(true);
            }
        }
    }

    fn set_mode<M: Bus>(&mut self, mem: &mut M, number: u8) -> bool {
        let Some(mode) = mode_by_number(number) else {
            return false;
        };
        self.mode = mode;
        self.cursor = [(0, 0); 8];
        self.active_page = 0;
        self.text_attr = 0x07;

        // Clear every page the mode exposes.
        let fill: &[u8] = if mode.graphics {
            &[0x00]
        } else {
            &[b' ', 0x07]
        };
        let total = mode.page_size * mode.pages as u32;
        let mut offset = 0;
        while offset < total {
            for (i, b) in fill.iter().enumerate() {
                mem.write_u8(mode.base + offset + i as u32, *b);
            }
            offset += fill.len() as u32;
        }

        mem.write_u8(BDA_VIDEO_MODE, mode.number);
        mem.write_u16(BDA_TEXT_COLUMNS, mode.cols);
        mem.write_u16(BDA_PAGE_SIZE, mode.page_size as u16);
        mem.write_u8(BDA_ACTIVE_PAGE, 0);
        for page in 0..8 {
            self.sync_bda_cursor(mem, page);
        }
        true
    }

    fn cell_addr(&self, page: u8, row: u8, col: u8) -> u32 {
        self.mode.base
            + page as u32 * self.mode.page_size
            + (row as u32 * self.mode.cols as u32 + col as u32) * 2
    }

    fn sync_bda_cursor<M: Bus>(&self, mem: &mut M, page: usize) {
        let (row, col) = self.cursor[page];
        mem.write_u16(
            BDA_CURSOR_POS + page as u32 * 2,
            ((row as u16) << 8) | col as u16,
        );
    }

    fn write_cell_run<M: Bus>(
        &mut self,
        mem: &mut M,
        page: u8,
        row: u8,
        col: u8,
        ch: u8,
        attr: Option<u8>,
        count: u16,
    ) {
        let cols = self.mode.cols;
        let rows = self.mode.rows;
        let mut row = row as u32;
        let mut col = col as u32;
        for _ in 0..count {
            if row >= rows as u32 {
                break;
            }
            let addr = self.cell_addr(page, row as u8, col as u8);
            mem.write_u8(addr, ch);
            if let Some(attr) = attr {
                mem.write_u8(addr + 1, attr);
            }
            col += 1;
            if col >= cols as u32 {
                col = 0;
                row += 1;
            }
        }
    }

    fn teletype<M: Bus>(&mut self, mem: &mut M, page: u8, ch: u8) {
        let (mut row, mut col) = self.cursor[(page & 7) as usize];
        match ch {
            b'\r' => col = 0,
            b'\n' => row = row.saturating_add(1),
            0x08 => {
                if col > 0 {
                    col -= 1;
                }
                let addr = self.cell_addr(page, row, col);
                mem.write_u8(addr, b' ');
            }
            0x07 => {} // BEL: nothing to ring
            ch => {
                let addr = self.cell_addr(page, row, col);
                mem.write_u8(addr, ch);
                mem.write_u8(addr + 1, self.text_attr);
                col += 1;
                if col as u16 >= self.mode.cols {
                    col = 0;
                    row = row.saturating_add(1);
                }
            }
        }

        if row as u16 >= self.mode.rows {
            self.scroll_page_up(mem, page, 1);
            row = (self.mode.rows - 1) as u8;
        }

        self.cursor[(page & 7) as usize] = (row, col);
        self.sync_bda_cursor(mem, (page & 7) as usize);
    }

    fn scroll_page_up<M: Bus>(&mut self, mem: &mut M, page: u8, lines: u8) {
        let rows = self.mode.rows as u8;
        let cols = self.mode.cols as u8;
        self.scroll_rect(mem, page, lines, true, self.text_attr, 0, 0, rows - 1, cols - 1);
    }

    /// AH=06h/07h: scroll a window up or down; AL=0 clears it. Blanked lines
    /// take the attribute in BH.
    fn scroll_window<M: Bus>(&mut self, cpu: &mut CpuState, mem: &mut M, up: bool) {
        let lines = cpu.al();
        let attr = cpu.bh();
        let (top, left) = (cpu.ch(), cpu.cl());
        let (bottom, right) = (cpu.dh(), cpu.dl());
        let page = self.active_page;
        self.scroll_rect(mem, page, lines, up, attr, top, left, bottom, right);
    }

    #[allow(clippy::too_many_arguments)]
    fn scroll_rect<M: Bus>(
        &mut self,
        mem: &mut M,
        page: u8,
        lines: u8,
        up: bool,
        attr: u8,
        top: u8,
        left: u8,
        bottom: u8,
        right: u8,
    ) {
        let height = bottom.saturating_sub(top) + 1;
        let clear_all = lines == 0 || lines >= height;
        let lines = if clear_all { height } else { lines };

        let copy_row = |mem: &mut M, src_row: u8, dst_row: u8| {
            for col in left..=right {
                let src = self.cell_addr(page, src_row, col);
                let dst = self.cell_addr(page, dst_row, col);
                let ch = mem.read_u8(src);
                let at = mem.read_u8(src + 1);
                mem.write_u8(dst, ch);
                mem.write_u8(dst + 1, at);
            }
        };

        if !clear_all {
            if up {
                for dst_row in top..=bottom - lines {
                    copy_row(mem, dst_row + lines, dst_row);
                }
            } else {
                for dst_row in (top + lines..=bottom).rev() {
                    copy_row(mem, dst_row - lines, dst_row);
                }
            }
        }

        // Blank the vacated (or entire) region.
        let blank = if clear_all {
            top..=bottom
        } else if up {
            bottom + 1 - lines..=bottom
        } else {
            top..=top + lines - 1
        };
        for row in blank {
            for col in left..=right {
                let addr = self.cell_addr(page, row, col);
                mem.write_u8(addr, b' ');
                mem.write_u8(addr + 1, attr);
            }
        }
    }

    /// AH=13h: write string from ES:BP.
    fn write_string<M: Bus>(&mut self, cpu: &mut CpuState, mem: &mut M) {
        let flags = cpu.al();
        let update_cursor = flags & 1 != 0;
        let with_attrs = flags & 2 != 0;
        let page = cpu.bh() & 7;
        let count = cpu.cx();
        let seg = cpu.segment(Segment::ES);
        let mut off = cpu.bp();

        let saved = self.cursor[page as usize];
        self.cursor[page as usize] = (cpu.dh(), cpu.dl());
        let saved_attr = self.text_attr;
        if !with_attrs {
            self.text_attr = cpu.bl();
        }

        for _ in 0..count {
            let ch = mem.read_seg_u8(seg, off);
            off = off.wrapping_add(1);
            if with_attrs {
                self.text_attr = mem.read_seg_u8(seg, off);
                off = off.wrapping_add(1);
            }
            self.teletype(mem, page, ch);
        }

        self.text_attr = saved_attr;
        if !update_cursor {
            self.cursor[page as usize] = saved;
            self.sync_bda_cursor(mem, page as usize);
        }
    }

    // --- INT 13h: disk ----------------------------------------------------

    fn int13<M: Bus, D: BlockDevice>(&mut self, cpu: &mut CpuState, mem: &mut M, disk: &mut D) {
        match cpu.ah() {
            0x00 => {
                cpu.set_ah(0);
                cpu.set_cf(false);
            }
            0x02 => self.disk_read(cpu, mem, disk),
            0x08 => {
                let geo = self.cfg.geometry;
                let max_cyl = geo.cylinders - 1;
                cpu.set_ch(max_cyl as u8);
                cpu.set_cl((geo.sectors_per_track as u8 & 0x3F) | (((max_cyl >> 2) & 0xC0) as u8));
                cpu.set_dh((geo.heads - 1) as u8);
                cpu.set_dl(1); // one drive
                cpu.set_bl(0x04); // 1.44M
                cpu.set_ah(0);
                cpu.set_cf(false);
            }
            0x15 => {
                // Disk type: floppy with change-line support.
                cpu.set_ah(0x02);
                cpu.set_cf(false);
            }
            other => {
                warn!(ah = other, "INT 13h: unhandled function");
                cpu.set_ah(DISK_STATUS_BAD_COMMAND);
                cpu.set_cf(true);
            }
        }
    }

    /// AH=02h: read AL sectors from CHS into ES:BX. The cylinder takes its
    /// high two bits from CL<7:6>; the sector number in CL<5:0> is 1-based.
    fn disk_read<M: Bus, D: BlockDevice>(&mut self, cpu: &mut CpuState, mem: &mut M, disk: &mut D) {
        let count = cpu.al() as u16;
        let cylinder = cpu.ch() as u16 | ((cpu.cl() as u16 & 0xC0) << 2);
        let sector = (cpu.cl() & 0x3F) as u16;
        let head = cpu.dh() as u16;
        let geo = self.cfg.geometry;

        if sector == 0 || sector > geo.sectors_per_track || head >= geo.heads {
            cpu.set_ah(DISK_STATUS_BAD_COMMAND);
            cpu.set_cf(true);
            return;
        }

        let seg = cpu.segment(Segment::ES);
        let mut offset = cpu.bx();
        let mut lba = geo.chs_to_lba(cylinder, head, sector);

        for _ in 0..count {
            let mut buf = [0u8; 512];
            match disk.read_sector(lba, &mut buf) {
                Ok(()) => {
                    for (i, b) in buf.iter().enumerate() {
                        mem.write_seg_u8(seg, offset.wrapping_add(i as u16), *b);
                    }
                }
                Err(_) => {
                    cpu.set_ah(DISK_STATUS_UNDEFINED_ERROR);
                    cpu.set_cf(true);
                    return;
                }
            }
            lba += 1;
            offset = offset.wrapping_add(512);
        }

        cpu.set_ah(0);
        cpu.set_cf(false);
    }

    // --- INT 15h: wait ----------------------------------------------------

    fn int15<S: SchedulerServices>(&mut self, cpu: &mut CpuState, sched: &mut S) {
        match cpu.ah() {
            0x86 => {
                let micros = ((cpu.cx() as u64) << 16) | cpu.dx() as u64;
                cpu.set_cf(true);
                sched.pause_for_micros(micros);
            }
            other => {
                warn!(ah = other, "INT 15h: unhandled function");
                cpu.set_ah(0x86); // function not supported
                cpu.set_cf(true);
            }
        }
    }

    // --- INT 16h: keyboard ------------------------------------------------

    fn int16<M: Bus, S: SchedulerServices>(&mut self, cpu: &mut CpuState, mem: &mut M, sched: &mut S) {
        match cpu.ah() {
            0x00 | 0x10 => {
                if let Some(key) = self.kb_buf.pop_front() {
                    cpu.set_ax(key);
                } else {
                    // Block: rewind to the INT instruction (2 bytes) and pause
                    // until a key arrives, so the read re-executes on resume.
                    let ip = cpu.ip();
                    cpu.set_ip(ip.wrapping_sub(2));
                    sched.pause_for_key();
                }
            }
            0x01 => {
                if let Some(&key) = self.kb_buf.front() {
                    cpu.set_ax(key);
                    cpu.set_flag(FLAG_ZF, false);
                } else {
                    cpu.set_flag(FLAG_ZF, true);
                }
                cpu.set_cf(false);
            }
            0x02 => {
                cpu.set_al(self.shift_flags);
                mem.write_u8(BDA_SHIFT_FLAGS, self.shift_flags);
                cpu.set_cf(false);
            }
            other => {
                warn!(ah = other, "INT 16h: unhandled function");
                cpu.set_cf(true);
            }
        }
    }
}
