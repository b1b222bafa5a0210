pub mod boot;
pub mod builder;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod images;
pub mod logging;
pub mod models;
pub mod paths;
pub mod runner;
pub mod share;
pub mod sys;
pub mod temp;

pub use boot::{required_properties, VirtualMediaBoot};
pub use builder::{ArtifactBuilder, BootIsoSpec, CommandArtifactBuilder};
pub use config::{ShareConfig, ShareKind, VmediaConfig};
pub use controller::{MediaController, ShareCoordinates, TransportResult, VirtualDrive};
pub use db::{NodeStore, SqliteNodeStore};
pub use error::{Result, TransportError, VmediaError};
pub use images::{DirectoryImageService, ImageService};
pub use models::{
    BootDevice, BootMode, BootOption, DriverInfo, InstanceInfo, NodeBootContext, Port,
    ProvisionState, RamdiskParams,
};
pub use runner::{run_phases, NodeJob, Phase, PhaseOutcome};
pub use sys::{MountTable, ProcMountTable};
