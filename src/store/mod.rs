pub mod file;
pub mod layout;
pub mod notifications;
pub mod settings;
pub mod xml;

pub use file::DataInfo;
pub use layout::RepoLayout;
pub use notifications::{NotificationStore, RetainedNotification};
pub use settings::{
    DurableSubscription, FileSettingsStore, MemorySettingsStore, ModuleSettings, SettingsStore,
};
