use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use block_dev::DeviceError;
use spin::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Vacant,
    /// 正在从设备读取
    Loading,
    Ready,
    /// 读取失败，等待者据此返回
    Failed(DeviceError),
}

impl State {
    const VACANT: u8 = 0;
    const LOADING: u8 = 1;
    const READY: u8 = 2;
    const FAILED_IO: u8 = 3;
    const FAILED_ARG: u8 = 4;

    fn encode(self) -> u8 {
        match self {
            Self::Vacant => Self::VACANT,
            Self::Loading => Self::LOADING,
            Self::Ready => Self::READY,
            Self::Failed(DeviceError::IoFailure) => Self::FAILED_IO,
            Self::Failed(DeviceError::InvalidArgument) => Self::FAILED_ARG,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            Self::LOADING => Self::Loading,
            Self::READY => Self::Ready,
            Self::FAILED_IO => Self::Failed(DeviceError::IoFailure),
            Self::FAILED_ARG => Self::Failed(DeviceError::InvalidArgument),
            _ => Self::Vacant,
        }
    }
}

/// 内存中的块缓冲区
pub(crate) struct Buffer {
    state: AtomicU8,
    /// 是否为脏块
    dirty: AtomicBool,
    /// 缓存的数据
    pub data: RwLock<Vec<u8>>,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::VACANT),
            dirty: AtomicBool::new(false),
            data: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> State {
        State::decode(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state.encode(), Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// 取走脏标记，返回此前是否为脏
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}
