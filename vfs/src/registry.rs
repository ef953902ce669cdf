use alloc::{boxed::Box, collections::BTreeMap, string::String, vec::Vec};
use core::fmt;

use log::info;

use crate::{Error, FileSystem, Result};

/// 创建文件系统实例的工厂
pub type Factory = Box<dyn Fn() -> Box<dyn FileSystem> + Send + Sync>;

/// 文件系统类型注册表，名称唯一
#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filesystem<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn FileSystem> + Send + Sync + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(Error::DuplicateName);
        }
        self.factories.insert(name.into(), Box::new(factory));
        info!("filesystem type {name} registered");

        Ok(())
    }

    /// 以注册的工厂创建一个新实例
    pub fn create(&self, name: &str) -> Result<Box<dyn FileSystem>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or(Error::UnknownFilesystem)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
