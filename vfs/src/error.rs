use alloc::string::String;

use block_dev::{DeviceError, TableError};
use derive_more::Display;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Error {
    #[display(fmt = "{}", _0)]
    Device(DeviceError),
    #[display(fmt = "corrupt partition table")]
    CorruptTable,
    /// 磁盘上的结构自相矛盾
    #[display(fmt = "corrupt filesystem")]
    CorruptFilesystem,
    #[display(fmt = "no such file or directory")]
    NotFound,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "is a directory")]
    IsADirectory,
    #[display(fmt = "file exists")]
    Exists,
    #[display(fmt = "directory not empty")]
    NotEmpty,
    #[display(fmt = "no space left")]
    NoSpace,
    #[display(fmt = "resource busy")]
    Busy,
    #[display(fmt = "filesystem type already registered")]
    DuplicateName,
    #[display(fmt = "unknown filesystem type")]
    UnknownFilesystem,
    #[display(fmt = "mount failed: {}", _0)]
    Mount(MountError),
    #[display(fmt = "invalid argument")]
    InvalidArgument,
    /// 文件名超过255字节
    #[display(fmt = "file name too long")]
    NameTooLong,
    /// 驱动不支持此操作
    #[display(fmt = "operation not supported")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MountError {
    /// 需要块设备的文件系统未得到设备
    #[display(fmt = "no source device")]
    NoDevice,
    #[display(fmt = "invalid superblock")]
    InvalidSuperblock,
    #[display(fmt = "{}", _0)]
    Device(DeviceError),
}

impl From<DeviceError> for Error {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<TableError> for Error {
    fn from(value: TableError) -> Self {
        match value {
            TableError::Device(err) => Self::Device(err),
            TableError::CorruptTable => Self::CorruptTable,
        }
    }
}

impl From<MountError> for Error {
    fn from(value: MountError) -> Self {
        Self::Mount(value)
    }
}

/// 附带出错路径的错误，由 [`crate::Vfs`] 返回
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display(fmt = "{}: {}", path, error)]
pub struct PathError {
    pub path: String,
    pub error: Error,
}

impl PathError {
    pub fn new(path: impl Into<String>, error: Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}
