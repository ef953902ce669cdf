//! # 分区表
//!
//! 支持 GPT 与 MBR 主分区表。
//! 扇区0带 0x55AA 签名且首个表项为保护性分区(0xEE)时按 GPT 解析，
//! 否则按 MBR 解析；两者都没有时视为未分区的设备。

use alloc::{string::String, sync::Arc, vec, vec::Vec};
use core::fmt;

use binrw::{BinRead, io::Cursor};
use derive_more::{Display, From, Into};
use log::{debug, error, info, warn};

use crate::{BlockDevice, DeviceError, check_request, crc32};

/// MBR 分区表项的起始偏移
const MBR_TABLE_OFFSET: usize = 446;
const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_ENTRY_COUNT: usize = 4;

const PROTECTIVE_MBR: u8 = 0xEE;
/// 扩展分区，其逻辑分区链不予解析
const EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
/// GPT 头的最小长度
const GPT_HEADER_MIN: usize = 92;
const GPT_ENTRY_MIN: usize = 128;
const GPT_ENTRY_MAX_COUNT: u32 = 1024;

/// CHS 转 LBA 所用的约定几何
const CHS_HEADS: u64 = 255;
const CHS_SECTORS: u64 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TableError {
    #[display(fmt = "{}", _0)]
    Device(DeviceError),
    #[display(fmt = "corrupt partition table")]
    CorruptTable,
}

impl From<DeviceError> for TableError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

/// 混合字节序存储的 GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, From, Into)]
pub struct Guid([u8; 16]);

impl Guid {
    pub const NIL: Self = Self([0; 16]);

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-",
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9]
        )?;
        b[10..].iter().try_for_each(|byte| write!(f, "{byte:02X}"))
    }
}

/// 分区表的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Gpt,
    Mbr,
    /// 设备没有分区表
    None,
}

/// 分区类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// MBR 的类型字节
    Mbr(u8),
    /// GPT 的类型 GUID
    Gpt(Guid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 在表中的序号，从0开始
    pub index: usize,
    pub start_lba: u64,
    pub sector_count: u64,
    pub kind: PartitionKind,
    /// GPT 独有
    pub unique_guid: Option<Guid>,
    pub bootable: bool,
    /// GPT 分区名，MBR 为空
    pub name: String,
}

impl Partition {
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sector_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub scheme: Scheme,
    pub partitions: Vec<Partition>,
}

/// MBR 分区表项，16字节
#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct MbrEntry {
    status: u8,
    first_chs: [u8; 3],
    kind: u8,
    last_chs: [u8; 3],
    first_lba: u32,
    sector_count: u32,
}

/// GPT 头，位于 LBA 1
#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct GptHeader {
    signature: [u8; 8],
    _revision: u32,
    header_size: u32,
    header_crc32: u32,
    _reserved: u32,
    _current_lba: u64,
    _backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    _disk_guid: [u8; 16],
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc32: u32,
}

/// GPT 分区表项的前128字节
#[derive(Debug, Clone, BinRead)]
#[br(little)]
struct GptEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    name: [u16; 36],
}

impl GptEntry {
    /// 传统 BIOS 可引导属性位
    const LEGACY_BOOTABLE: u64 = 1 << 2;
}

impl PartitionTable {
    pub fn parse(dev: &dyn BlockDevice) -> Result<Self, TableError> {
        let sector_size = dev.sector_size();
        let mut sector0 = vec![0; sector_size];
        dev.read_sectors(0, 1, &mut sector0)?;

        if sector0[MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2] != MBR_SIGNATURE {
            debug!("no boot signature, device is unpartitioned");
            return Ok(Self {
                scheme: Scheme::None,
                partitions: Vec::new(),
            });
        }

        let entries = mbr_entries(&sector0)?;
        let table = if entries[0].kind == PROTECTIVE_MBR {
            Self {
                scheme: Scheme::Gpt,
                partitions: parse_gpt(dev)?,
            }
        } else {
            Self {
                scheme: Scheme::Mbr,
                partitions: parse_mbr(&entries),
            }
        };
        info!(
            "{:?} partition table with {} partitions",
            table.scheme,
            table.partitions.len()
        );

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }
}

fn mbr_entries(sector0: &[u8]) -> Result<Vec<MbrEntry>, TableError> {
    let mut cursor = Cursor::new(&sector0[MBR_TABLE_OFFSET..MBR_SIGNATURE_OFFSET]);
    (0..MBR_ENTRY_COUNT)
        .map(|_| MbrEntry::read(&mut cursor).map_err(|_| TableError::CorruptTable))
        .collect()
}

fn parse_mbr(entries: &[MbrEntry]) -> Vec<Partition> {
    let mut partitions = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.kind == 0 {
            continue;
        }
        if EXTENDED_TYPES.contains(&entry.kind) {
            warn!(
                "MBR entry {index}: extended partition {:#04x} is not supported, skipped",
                entry.kind
            );
            continue;
        }

        let (start_lba, sector_count) = if entry.first_lba != 0 {
            (entry.first_lba as u64, entry.sector_count as u64)
        } else {
            let start = chs_to_lba(entry.first_chs);
            let count = match entry.sector_count {
                0 => (chs_to_lba(entry.last_chs) + 1).saturating_sub(start),
                n => n as u64,
            };
            (start, count)
        };

        partitions.push(Partition {
            index,
            start_lba,
            sector_count,
            kind: PartitionKind::Mbr(entry.kind),
            unique_guid: None,
            bootable: entry.status & 0x80 != 0,
            name: String::new(),
        });
    }

    partitions
}

/// 以 255磁头/63扇区 的约定几何换算
fn chs_to_lba(chs: [u8; 3]) -> u64 {
    let head = chs[0] as u64;
    let sector = (chs[1] & 0x3F) as u64;
    let cylinder = (((chs[1] & 0xC0) as u64) << 2) | chs[2] as u64;

    (cylinder * CHS_HEADS + head) * CHS_SECTORS + sector.saturating_sub(1)
}

fn parse_gpt(dev: &dyn BlockDevice) -> Result<Vec<Partition>, TableError> {
    let sector_size = dev.sector_size();
    let mut sector1 = vec![0; sector_size];
    dev.read_sectors(1, 1, &mut sector1)?;

    let header = GptHeader::read(&mut Cursor::new(&sector1[..GPT_HEADER_MIN]))
        .map_err(|_| TableError::CorruptTable)?;
    if header.signature != GPT_SIGNATURE {
        error!("GPT header signature mismatch");
        return Err(TableError::CorruptTable);
    }

    let header_size = header.header_size as usize;
    if !(GPT_HEADER_MIN..=sector_size).contains(&header_size) {
        error!("GPT header size {header_size} out of range");
        return Err(TableError::CorruptTable);
    }
    let mut raw = sector1[..header_size].to_vec();
    // 计算时校验和字段视为0
    raw[16..20].fill(0);
    if crc32(&raw) != header.header_crc32 {
        error!("GPT header CRC mismatch");
        return Err(TableError::CorruptTable);
    }

    let entry_size = header.entry_size as usize;
    if entry_size < GPT_ENTRY_MIN
        || entry_size % 8 != 0
        || header.entry_count > GPT_ENTRY_MAX_COUNT
    {
        error!(
            "GPT entry array {} x {entry_size} is not plausible",
            header.entry_count
        );
        return Err(TableError::CorruptTable);
    }
    let array_len = header.entry_count as usize * entry_size;
    let sectors = array_len.div_ceil(sector_size);
    let mut array = vec![0; sectors * sector_size];
    if check_request(dev, header.entries_lba, sectors, array.len()).is_err() {
        error!("GPT entry array lies outside the device");
        return Err(TableError::CorruptTable);
    }
    dev.read_sectors(header.entries_lba, sectors, &mut array)?;
    if crc32(&array[..array_len]) != header.entries_crc32 {
        error!("GPT entry array CRC mismatch");
        return Err(TableError::CorruptTable);
    }

    let mut partitions = Vec::new();
    for (index, raw) in array[..array_len].chunks_exact(entry_size).enumerate() {
        let entry = GptEntry::read(&mut Cursor::new(&raw[..GPT_ENTRY_MIN]))
            .map_err(|_| TableError::CorruptTable)?;
        let kind = Guid(entry.type_guid);
        if kind.is_nil() {
            continue;
        }
        if entry.last_lba < entry.first_lba
            || entry.first_lba < header.first_usable_lba
            || entry.last_lba > header.last_usable_lba
        {
            error!(
                "GPT entry {index} spans {}..={} outside the usable area",
                entry.first_lba, entry.last_lba
            );
            return Err(TableError::CorruptTable);
        }

        let name = char::decode_utf16(entry.name.iter().copied().take_while(|&c| c != 0))
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        partitions.push(Partition {
            index,
            start_lba: entry.first_lba,
            sector_count: entry.last_lba - entry.first_lba + 1,
            kind: PartitionKind::Gpt(kind),
            unique_guid: Some(Guid(entry.unique_guid)),
            bootable: entry.attributes & GptEntry::LEGACY_BOOTABLE != 0,
            name,
        });
    }

    Ok(partitions)
}

/// 限定在单个分区范围内的块设备
pub struct PartitionDevice {
    parent: Arc<dyn BlockDevice>,
    start: u64,
    count: u64,
}

impl PartitionDevice {
    /// 分区超出父设备范围时返回 [`DeviceError::InvalidArgument`]
    pub fn new(parent: Arc<dyn BlockDevice>, partition: &Partition) -> Result<Self, DeviceError> {
        if partition.end_lba() > parent.sector_count() {
            return Err(DeviceError::InvalidArgument);
        }

        Ok(Self {
            parent,
            start: partition.start_lba,
            count: partition.sector_count,
        })
    }

    pub fn start_lba(&self) -> u64 {
        self.start
    }
}

impl fmt::Debug for PartitionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionDevice")
            .field("start", &self.start)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl BlockDevice for PartitionDevice {
    fn sector_size(&self) -> usize {
        self.parent.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.count
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        self.parent.read_sectors(self.start + start, count, buf)
    }

    fn write_sectors(&self, start: u64, count: usize, buf: &[u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        self.parent.write_sectors(self.start + start, count, buf)
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.parent.flush()
    }
}
