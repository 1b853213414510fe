//! Decoder surface for the ETM instruction-flow protocol (ETMv3-style
//! encoding, see the [Embedded Trace Macrocell architecture
//! specification](https://developer.arm.com/documentation/ihi0014/q/)).
//!
//! Instruction trace is consumed buffer-at-a-time, usually drained out of
//! a post-mortem capture ring. The decoder maintains a packed CPU state
//! and reports, for every packet, a change mask describing which state
//! fields the packet updated.

/// Change mask over [`CpuState`] fields.
///
/// Each constant names one field (or field group) a packet may update;
/// the mask accompanying an `on_state` callback holds the union for the
/// packet that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Changes(pub u32);

impl Changes {
    pub const ADDRESS: Changes = Changes(1 << 0);
    pub const ATOMS: Changes = Changes(1 << 1);
    pub const DISPOSITION: Changes = Changes(1 << 2);
    pub const VMID: Changes = Changes(1 << 3);
    pub const CONTEXT_ID: Changes = Changes(1 << 4);
    pub const SECURE: Changes = Changes(1 << 5);
    pub const NON_SECURE: Changes = Changes(1 << 6);
    pub const EXCEPTION_ENTRY: Changes = Changes(1 << 7);
    pub const EXCEPTION_EXIT: Changes = Changes(1 << 8);
    pub const TRIGGER: Changes = Changes(1 << 9);
    pub const TIMESTAMP: Changes = Changes(1 << 10);
    pub const CYCLE_COUNT: Changes = Changes(1 << 11);
    pub const CLOCKSPEED: Changes = Changes(1 << 12);
    pub const ISLSIP: Changes = Changes(1 << 13);
    pub const ALT_ISA: Changes = Changes(1 << 14);
    pub const HYP: Changes = Changes(1 << 15);
    pub const JAZELLE: Changes = Changes(1 << 16);
    pub const THUMB: Changes = Changes(1 << 17);

    pub fn set(&mut self, other: Changes) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: Changes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Packed CPU execution state reconstructed from the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuState {
    /// Current instruction address.
    pub addr: u32,

    /// Executed-instruction atoms in the last P-header.
    pub eatoms: u8,

    /// Skipped-instruction atoms in the last P-header.
    pub natoms: u8,

    /// Atom bitmap of the last P-header, oldest atom in bit 0, set bits
    /// executed.
    pub disposition: u32,

    /// Virtual machine identifier.
    pub vmid: u8,

    /// Context (process) identifier.
    pub context_id: u32,

    /// Exception number of the last entry or exit.
    pub exception: u16,

    /// Target timestamp, continuation-encoded.
    pub timestamp: u64,

    /// Accumulated cycle count.
    pub cycle_count: u32,

    /// Reported core clock speed, when the target publishes one.
    pub clockspeed: u32,

    /// Core is in the secure state.
    pub secure: bool,

    /// Thumb instruction set active.
    pub thumb: bool,

    /// Jazelle instruction set active.
    pub jazelle: bool,

    /// Alternative instruction set active.
    pub alt_isa: bool,

    /// Hypervisor mode active.
    pub hyp: bool,

    /// Instruction-set load/store-in-progress marker from an LSiP
    /// I-Sync.
    pub islsip: bool,
}

/// Diagnostic reports surfaced by the decoder beside state updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtmReport {
    /// Alignment acquired from an A-Sync sequence.
    Synced,

    /// Alignment lost or dropped on request.
    Unsynced,

    /// Instruction-stream synchronisation point: reason and address.
    ISync { kind: u8, addr: u32 },

    /// A byte that decodes to no known packet was skipped.
    BadPacket { header: u8 },
}

/// Cumulative decoder statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EtmStats {
    pub bytes: u64,
    pub syncs: u64,
    pub isyncs: u64,
    pub packets: u64,
    pub bad_packets: u64,
}

/// Six-byte A-Sync window: five zero bytes then `0x80`.
const ASYNC_MASK: u64 = 0xFFFF_FFFF_FFFF;
const ASYNC_PATTERN: u64 = 0x0000_0000_0080;

/// Collection phase for multi-byte packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EtmState {
    /// Hunting for an A-Sync sequence.
    Unsynced,

    /// Awaiting a packet header.
    Idle,

    /// Branch address accumulation; `got` bytes consumed so far.
    BranchAddr { got: u8 },

    /// Exception information bytes following a branch address.
    BranchExcept { got: u8 },

    /// I-Sync: context ID bytes, then the info byte, then the address.
    Isync { got: u8 },

    /// Context ID packet payload.
    ContextId { got: u8 },

    /// VMID packet payload.
    Vmid,

    /// Timestamp packet, continuation-terminated.
    Timestamp { got: u8 },

    /// Cycle count packet, continuation-terminated.
    CycleCount { got: u8 },
}

/// The stateful instruction-trace decoder.
#[derive(Debug)]
pub struct EtmDecoder {
    state: EtmState,
    last_bytes: u64,

    /// Number of context-ID bytes the target is configured to emit in
    /// I-Sync and context-ID packets. Cannot be inferred from the
    /// stream.
    context_bytes: u8,

    cpu: CpuState,
    changes: Changes,

    /// Scratch for multi-byte accumulation.
    scratch: u64,

    /// Exception indicator seen on the final branch-address byte.
    branch_exception: bool,

    stats: EtmStats,
}

impl EtmDecoder {
    /// Creates a decoder in the unsynchronised state. `context_bytes` is
    /// the configured context-ID size (0, 1, 2 or 4).
    pub fn new(context_bytes: u8) -> EtmDecoder {
        EtmDecoder {
            state: EtmState::Unsynced,
            last_bytes: !0,
            context_bytes,
            cpu: CpuState::default(),
            changes: Changes::default(),
            scratch: 0,
            branch_exception: false,
            stats: EtmStats::default(),
        }
    }

    /// Cumulative statistics for this decoder instance.
    pub fn stats(&self) -> &EtmStats {
        &self.stats
    }

    /// The current reconstructed CPU state.
    pub fn cpu_state(&self) -> &CpuState {
        &self.cpu
    }

    /// Change mask of the most recently completed packet.
    pub fn changes(&self) -> Changes {
        self.changes
    }

    /// Forces the synchronisation state out of band. Dropping sync is
    /// required before decoding a capture that wrapped, since its oldest
    /// bytes no longer start on a packet boundary.
    pub fn force_sync(&mut self, synced: bool) {
        self.state = if synced {
            EtmState::Idle
        } else {
            EtmState::Unsynced
        };
    }

    /// Consumes a buffer, invoking `on_state` with the updated CPU state
    /// and its change mask after every state-bearing packet, and
    /// `on_report` for alignment events and skipped bytes.
    pub fn pump<S, R>(&mut self, bytes: &[u8], mut on_state: S, mut on_report: R)
    where
        S: FnMut(&CpuState, Changes),
        R: FnMut(EtmReport),
    {
        for byte in bytes {
            self.pump_byte(*byte, &mut on_state, &mut on_report);
        }
    }

    fn pump_byte<S, R>(&mut self, byte: u8, on_state: &mut S, on_report: &mut R)
    where
        S: FnMut(&CpuState, Changes),
        R: FnMut(EtmReport),
    {
        self.stats.bytes += 1;
        self.last_bytes = (self.last_bytes << 8) | u64::from(byte);

        if self.last_bytes & ASYNC_MASK == ASYNC_PATTERN {
            self.state = EtmState::Idle;
            self.stats.syncs += 1;
            on_report(EtmReport::Synced);
            return;
        }

        match self.state {
            EtmState::Unsynced => (),
            EtmState::Idle => self.header(byte, on_state, on_report),
            EtmState::BranchAddr { got } => self.branch_addr(byte, got, on_state),
            EtmState::BranchExcept { got } => self.branch_except(byte, got, on_state),
            EtmState::Isync { got } => self.isync(byte, got, on_state, on_report),
            EtmState::ContextId { got } => self.context_id(byte, got, on_state),
            EtmState::Vmid => {
                self.cpu.vmid = byte;
                self.finish(Changes::VMID, on_state);
            }
            EtmState::Timestamp { got } => self.timestamp(byte, got, on_state),
            EtmState::CycleCount { got } => self.cycle_count(byte, got, on_state),
        }
    }

    fn header<S, R>(&mut self, byte: u8, on_state: &mut S, on_report: &mut R)
    where
        S: FnMut(&CpuState, Changes),
        R: FnMut(EtmReport),
    {
        self.scratch = 0;
        self.changes = Changes::default();
        self.branch_exception = false;

        match byte {
            // A-Sync padding; the rolling window above completes it.
            0x00 => (),

            // I-Sync.
            0x08 => {
                self.state = EtmState::Isync { got: 0 };
            }

            // Trigger.
            0x0C => {
                self.finish(Changes::TRIGGER, on_state);
            }

            // Cycle count.
            0x04 => {
                self.state = EtmState::CycleCount { got: 0 };
            }

            // Timestamp.
            0x42 | 0x46 => {
                self.state = EtmState::Timestamp { got: 0 };
            }

            // Context ID.
            0x6E => {
                if self.context_bytes == 0 {
                    self.finish(Changes::CONTEXT_ID, on_state);
                } else {
                    self.state = EtmState::ContextId { got: 0 };
                }
            }

            // VMID.
            0x3C => {
                self.state = EtmState::Vmid;
            }

            // Exception return.
            0x76 => {
                self.cpu.exception = 0;
                self.finish(Changes::EXCEPTION_EXIT, on_state);
            }

            // P-header, format 1: bit 7 set, low two bits clear;
            // executed-atom count in bits 5..=2, not-executed in bit 6.
            b if b & 0x83 == 0x80 => {
                let eatoms = (b >> 2) & 0x0F;
                let natoms = (b >> 6) & 0x01;
                self.cpu.eatoms = eatoms;
                self.cpu.natoms = natoms;
                // Oldest atom lands in bit 0; E atoms precede N atoms.
                self.cpu.disposition = (1u32 << eatoms) - 1;
                let mut changes = Changes::ATOMS;
                changes.set(Changes::DISPOSITION);
                self.finish(changes, on_state);
            }

            // Branch address, first byte: bit 0 set, six address bits.
            b if b & 0x01 == 0x01 => {
                self.scratch = u64::from((b >> 1) & 0x3F);
                if b & 0x80 == 0 {
                    self.apply_branch(6, on_state);
                } else {
                    self.state = EtmState::BranchAddr { got: 1 };
                }
            }

            b => {
                self.stats.bad_packets += 1;
                on_report(EtmReport::BadPacket { header: b });
            }
        }
    }

    /// Continuation bytes of a branch address: seven bits each, up to
    /// five bytes total. The final byte may flag exception information.
    fn branch_addr<S>(&mut self, byte: u8, got: u8, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        let shift = 6 + 7 * (u32::from(got) - 1);
        self.scratch |= u64::from(byte & 0x7F) << shift;
        let got = got + 1;

        if byte & 0x80 != 0 && got < 5 {
            self.state = EtmState::BranchAddr { got };
            return;
        }

        // Fifth byte: bit 6 flags a following exception byte.
        if got == 5 && byte & 0x40 != 0 {
            self.branch_exception = true;
        }

        let bits = 6 + 7 * (u32::from(got) - 1);
        if self.branch_exception {
            self.state = EtmState::BranchExcept { got: 0 };
            self.scratch &= (1 << bits) - 1;
            let addr_bits = self.scratch;
            self.merge_branch_address(addr_bits, bits.min(32));
        } else {
            self.apply_branch(bits.min(32), on_state);
        }
    }

    fn apply_branch<S>(&mut self, bits: u32, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        let addr_bits = self.scratch;
        self.merge_branch_address(addr_bits, bits);
        self.finish(Changes::ADDRESS, on_state);
    }

    /// Alternate (compressed) branch encoding: the packet carries only
    /// the low-order address bits that changed; upper bits persist from
    /// the previous address. Addresses are instruction-aligned, so the
    /// carried bits are shifted by one (Thumb) or two (ARM).
    fn merge_branch_address(&mut self, addr_bits: u64, bits: u32) {
        let shift = if self.cpu.thumb { 1 } else { 2 };
        let bits = (bits + shift).min(32);
        let value = (addr_bits as u32) << shift;
        if bits >= 32 {
            self.cpu.addr = value;
        } else {
            let mask = (1u32 << bits) - 1;
            self.cpu.addr = (self.cpu.addr & !mask) | (value & mask);
        }
    }

    /// Exception information byte(s) after a branch address.
    fn branch_except<S>(&mut self, byte: u8, got: u8, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        if got == 0 {
            self.cpu.exception = u16::from((byte >> 1) & 0x0F);
            if byte & 0x80 != 0 {
                self.state = EtmState::BranchExcept { got: 1 };
                return;
            }
        } else {
            self.cpu.exception |= u16::from(byte & 0x1F) << 4;
        }

        let mut changes = Changes::ADDRESS;
        changes.set(Changes::EXCEPTION_ENTRY);
        self.finish(changes, on_state);
    }

    /// I-Sync payload: configured context-ID bytes, one info byte, then
    /// a four-byte little-endian address.
    fn isync<S, R>(&mut self, byte: u8, got: u8, on_state: &mut S, on_report: &mut R)
    where
        S: FnMut(&CpuState, Changes),
        R: FnMut(EtmReport),
    {
        let ctxt = self.context_bytes;

        if got < ctxt {
            if got == 0 {
                self.cpu.context_id = 0;
            }
            self.cpu.context_id |= u32::from(byte) << (8 * got);
            self.state = EtmState::Isync { got: got + 1 };
            return;
        }

        if got == ctxt {
            // Info byte.
            let info = byte;
            self.cpu.secure = info & 0x08 == 0;
            self.cpu.alt_isa = info & 0x10 != 0;
            self.cpu.hyp = info & 0x04 != 0;
            self.cpu.jazelle = info & 0x02 != 0;
            self.cpu.islsip = info & 0x01 != 0;
            self.scratch = u64::from((info >> 5) & 0x03); // reason
            self.state = EtmState::Isync { got: got + 1 };
            return;
        }

        // Address bytes, little-endian.
        let index = got - ctxt - 1;
        if index == 0 {
            self.cpu.addr = 0;
        }
        self.cpu.addr |= u32::from(byte) << (8 * index);
        if index < 3 {
            self.state = EtmState::Isync { got: got + 1 };
            return;
        }

        // Address bit 0 carries the Thumb state.
        self.cpu.thumb = self.cpu.addr & 1 != 0;
        self.cpu.addr &= !1;

        self.stats.isyncs += 1;
        let kind = self.scratch as u8;
        on_report(EtmReport::ISync {
            kind,
            addr: self.cpu.addr,
        });

        let mut changes = Changes::ADDRESS;
        changes.set(Changes::SECURE);
        changes.set(Changes::NON_SECURE);
        changes.set(Changes::THUMB);
        changes.set(Changes::JAZELLE);
        changes.set(Changes::ALT_ISA);
        changes.set(Changes::HYP);
        changes.set(Changes::ISLSIP);
        if ctxt > 0 {
            changes.set(Changes::CONTEXT_ID);
        }
        self.finish(changes, on_state);
    }

    fn context_id<S>(&mut self, byte: u8, got: u8, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        if got == 0 {
            self.cpu.context_id = 0;
        }
        self.cpu.context_id |= u32::from(byte) << (8 * got);
        if got + 1 < self.context_bytes {
            self.state = EtmState::ContextId { got: got + 1 };
        } else {
            self.finish(Changes::CONTEXT_ID, on_state);
        }
    }

    fn timestamp<S>(&mut self, byte: u8, got: u8, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        self.scratch |= u64::from(byte & 0x7F) << (7 * u32::from(got));
        if byte & 0x80 != 0 && got < 8 {
            self.state = EtmState::Timestamp { got: got + 1 };
            return;
        }

        self.cpu.timestamp = self.scratch;
        self.finish(Changes::TIMESTAMP, on_state);
    }

    fn cycle_count<S>(&mut self, byte: u8, got: u8, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        self.scratch |= u64::from(byte & 0x7F) << (7 * u32::from(got));
        if byte & 0x80 != 0 && got < 4 {
            self.state = EtmState::CycleCount { got: got + 1 };
            return;
        }

        self.cpu.cycle_count = self.cpu.cycle_count.wrapping_add(self.scratch as u32);
        self.finish(Changes::CYCLE_COUNT, on_state);
    }

    fn finish<S>(&mut self, changes: Changes, on_state: &mut S)
    where
        S: FnMut(&CpuState, Changes),
    {
        self.state = EtmState::Idle;
        self.stats.packets += 1;
        self.changes = changes;
        on_state(&self.cpu, changes);
    }
}
