use alloc::{vec, vec::Vec};

use spin::Mutex;

use crate::{BlockDevice, DeviceError, check_request};

/// 以内存为介质的块设备
#[derive(Debug)]
pub struct RamDisk {
    sector_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    /// 创建 `sector_count` 个扇区的全零内存盘
    pub fn new(sector_size: usize, sector_count: u64) -> Self {
        assert!(
            sector_size.is_power_of_two() && sector_size >= 512,
            "bad sector size {sector_size}"
        );

        Self {
            sector_size,
            data: Mutex::new(vec![0; sector_size * sector_count as usize]),
        }
    }

    /// 以现成的镜像创建，镜像末尾不足一扇区的部分补零
    pub fn from_image(sector_size: usize, mut image: Vec<u8>) -> Self {
        assert!(
            sector_size.is_power_of_two() && sector_size >= 512,
            "bad sector size {sector_size}"
        );
        let len = image.len().div_ceil(sector_size) * sector_size;
        image.resize(len, 0);

        Self {
            sector_size,
            data: Mutex::new(image),
        }
    }

    /// 当前内容的拷贝
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().len() / self.sector_size) as u64
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        let offset = start as usize * self.sector_size;
        buf.copy_from_slice(&self.data.lock()[offset..offset + buf.len()]);

        Ok(())
    }

    fn write_sectors(&self, start: u64, count: usize, buf: &[u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        let offset = start as usize * self.sector_size;
        self.data.lock()[offset..offset + buf.len()].copy_from_slice(buf);

        Ok(())
    }
}
