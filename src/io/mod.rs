//! I/O: the database source and the object store sink.

mod source;
mod store;
mod uploader;

pub use source::{copy_statement, quote_table, PostgresSource, RowSource, SourceStream};
pub use store::{create_output_store, create_s3_store, parse_s3_uri, upload_config};
pub use uploader::{Body, ObjectStoreUploader, StorageUploader, UploadConfig, UploadReceipt};
