//! Packages an experiment or metric declares it needs on every organization.
//!
//! The local backend only records them; nothing is installed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub packages: Vec<String>,
    pub local_code: Vec<PathBuf>,
}

impl Dependency {
    /// Each package must be pinned as `name==version`.
    pub fn new<I, S>(packages: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let packages: Vec<String> = packages.into_iter().map(Into::into).collect();
        for p in &packages {
            match p.split_once("==") {
                Some((name, version)) if !name.trim().is_empty() && !version.trim().is_empty() => {}
                _ => return Err(PlatformError::invalid("dependency", format!("`{p}` is not pinned as name==version"))),
            }
        }
        Ok(Self { packages, local_code: Vec::new() })
    }

    pub fn with_local_code(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_code.push(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_packages_accepted() {
        let d = Dependency::new(["ndarray==0.15.6", "rand==0.8.5"]).unwrap();
        assert_eq!(d.packages.len(), 2);
    }

    #[test]
    fn unpinned_package_rejected() {
        assert!(Dependency::new(["ndarray"]).is_err());
        assert!(Dependency::new(["==1.0"]).is_err());
    }
}
