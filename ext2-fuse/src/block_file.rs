use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use block_dev::{BlockDevice, DeviceError, check_request};
use log::error;

/// 镜像文件按512字节的扇区读写
pub const SECTOR_SIZE: usize = 512;

/// 以宿主文件为介质的块设备，文件长度决定扇区数
#[derive(Debug)]
pub struct BlockFile {
    file: Mutex<File>,
    sector_count: u64,
}

impl BlockFile {
    pub fn new(file: File) -> io::Result<Self> {
        let sector_count = file.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(Self {
            file: Mutex::new(file),
            sector_count,
        })
    }

    fn with_file(
        &self,
        start: u64,
        op: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> Result<(), DeviceError> {
        let mut file = self.file.lock().map_err(|_| DeviceError::IoFailure)?;
        file.seek(SeekFrom::Start(start * SECTOR_SIZE as u64))
            .and_then(|_| op(&mut file))
            .map_err(|err| {
                error!("image I/O at sector {start}: {err}");
                DeviceError::IoFailure
            })
    }
}

impl BlockDevice for BlockFile {
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&self, start: u64, count: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        self.with_file(start, |file| file.read_exact(buf))
    }

    fn write_sectors(&self, start: u64, count: usize, buf: &[u8]) -> Result<(), DeviceError> {
        check_request(self, start, count, buf.len())?;
        self.with_file(start, |file| file.write_all(buf))
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.with_file(0, |file| file.sync_data())
    }
}
