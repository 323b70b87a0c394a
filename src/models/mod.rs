mod lab;

pub use lab::{
    derive_ide_urls, IdeType, LabConfig, LabEnvironment, LabOperationResult, LabStatus,
};
