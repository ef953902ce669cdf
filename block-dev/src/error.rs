use derive_more::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceError {
    /// 底层传输失败
    #[display(fmt = "device I/O failure")]
    IoFailure,
    /// 扇区越界，或缓冲区长度与请求不符
    #[display(fmt = "invalid sector request")]
    InvalidArgument,
}
