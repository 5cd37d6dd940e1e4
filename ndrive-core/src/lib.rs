mod client;
mod models;

pub use client::{ApiErrorClass, ClientConfig, Document, NuxeoClient, NuxeoError};
pub use models::{
    BatchFileInfo, BatchUpload, ChangeSummary, FileSystemChange, FileSystemItem, RemoteFileInfo,
    ScrollBatch,
};
