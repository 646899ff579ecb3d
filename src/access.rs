use crate::core::Result;

/// Collaborator contract for access-control lookups.
///
/// The engine never evaluates rules itself; it asks per (user, module)
/// before reading or writing and surfaces denials as Unauthorized.
pub trait AccessControl: Send + Sync {
    fn check_read(&self, user: &str, module: &str) -> Result<()>;
    fn check_write(&self, user: &str, module: &str) -> Result<()>;
}

/// Allow-everything default.
pub struct Permissive;

impl AccessControl for Permissive {
    fn check_read(&self, _user: &str, _module: &str) -> Result<()> {
        Ok(())
    }

    fn check_write(&self, _user: &str, _module: &str) -> Result<()> {
        Ok(())
    }
}
