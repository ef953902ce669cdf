//! # 块设备接口层
//!
//! 块设备以**扇区**为单位存储数据，例如磁盘、分区、内存盘；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 上层的缓冲区缓存与文件系统驱动只通过此特质访问设备。

#![no_std]

extern crate alloc;

mod error;
pub mod partition;
mod ram_disk;

use core::any::Any;

pub use self::{
    error::DeviceError,
    partition::{
        Guid, Partition, PartitionDevice, PartitionKind, PartitionTable, Scheme, TableError,
    },
    ram_disk::RamDisk,
};

/// 块设备驱动特质
///
/// 读写均以整扇区为单位，`buf` 的长度必须恰为 `count * sector_size()`。
/// 越界或长度不符时返回 [`DeviceError::InvalidArgument`]，
/// 且不得触碰任何数据。
pub trait BlockDevice: Send + Sync + Any {
    /// 单个扇区的字节量，为2的幂且不小于512
    fn sector_size(&self) -> usize;

    /// 设备的扇区总数
    fn sector_count(&self) -> u64;

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError>;

    fn write_sectors(&self, start: u64, count: usize, buf: &[u8]) -> Result<(), DeviceError>;

    /// 将设备自身的写缓存落盘
    fn flush(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// 检查一次扇区读写请求是否合法，供驱动实现复用
pub fn check_request(
    dev: &dyn BlockDevice,
    start: u64,
    count: usize,
    len: usize,
) -> Result<(), DeviceError> {
    let end = start
        .checked_add(count as u64)
        .ok_or(DeviceError::InvalidArgument)?;
    let expected = count
        .checked_mul(dev.sector_size())
        .ok_or(DeviceError::InvalidArgument)?;
    if end > dev.sector_count() || expected != len {
        return Err(DeviceError::InvalidArgument);
    }

    Ok(())
}

/// CRC-32 (IEEE 802.3，反射多项式 0xEDB88320)，GPT 校验用
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut k = 0;
            while k < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                k += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(!0u32, |crc, &byte| {
        TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}
