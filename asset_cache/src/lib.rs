#![forbid(unsafe_code)]

pub mod cache_key;
pub mod cache_paths;
pub mod config;
pub mod converter;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod manager;
pub mod observability;
pub mod resolver;
pub mod storage;
pub mod worker;

pub use cache_key::{CacheKey, CacheKeyBuilder, SourceIdentity};
pub use config::CacheConfig;
pub use converter::{
    AssetKind, ConversionError, ConversionMode, ConversionSettings, Converter, ConverterRegistry,
    CopyConverter,
};
pub use error::CacheError;
pub use manager::{AssetCacheManager, CompletedLoad, LoadTicket, Loadable};
pub use resolver::{CacheLocation, CacheResolver, ResolveReport, ResolverSettings};
pub use storage::{FileStat, LayeredStorage, MemoryStorage, Storage, StorageError};
pub use worker::{ConversionWorker, RequestTag};
