//! Per-run registry of connection factories and schema catalogs.
//!
//! One registry is built for a test run, handed down to whatever needs
//! connections, and shut down explicitly at the end. Factories are cached by
//! driver, URL and connection source; catalog documents are written once to
//! temp files keyed by content.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::{NoExpand, Regex};
use tck_error::{Result, TckError};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::driver::{Credentials, Driver};
use crate::pool::{ConnectionFactory, ConnectionSource};

static CATALOG_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Catalog=[^;]+;").expect("catalog pattern is valid"));

/// Distinct driver instances never share a factory, even under one name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FactoryKey {
    driver: String,
    instance: usize,
    url: String,
    source: ConnectionSource,
}

/// Address of the driver instance. The cached factory holds the `Arc`, so
/// the address cannot be reused while the key is live.
fn driver_instance(driver: &Arc<dyn Driver>) -> usize {
    Arc::as_ptr(driver).cast::<()>() as usize
}

/// Owns every factory and catalog file created during one run.
#[derive(Debug)]
pub struct ConnectionFactoryRegistry {
    credentials: Credentials,
    acquire_timeout: Duration,
    factories: Mutex<HashMap<FactoryKey, Arc<ConnectionFactory>>>,
    catalogs: Mutex<HashMap<String, NamedTempFile>>,
    shut_down: Mutex<bool>,
}

impl ConnectionFactoryRegistry {
    pub fn new(credentials: Credentials, acquire_timeout: Duration) -> Self {
        Self {
            credentials,
            acquire_timeout,
            factories: Mutex::new(HashMap::new()),
            catalogs: Mutex::new(HashMap::new()),
            shut_down: Mutex::new(false),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.shut_down.lock() {
            Err(TckError::harness("connection factory registry is shut down"))
        } else {
            Ok(())
        }
    }

    /// The cached factory for `(driver instance, url, source)`, created on
    /// first use.
    pub fn factory(
        &self,
        driver: &Arc<dyn Driver>,
        url: &str,
        source: ConnectionSource,
    ) -> Result<Arc<ConnectionFactory>> {
        self.ensure_running()?;
        let key = FactoryKey {
            driver: driver.name().to_owned(),
            instance: driver_instance(driver),
            url: url.to_owned(),
            source,
        };
        let mut factories = self.factories.lock();
        if let Some(existing) = factories.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let factory = ConnectionFactory::new(
            Arc::clone(driver),
            url,
            self.credentials.clone(),
            source,
            self.acquire_timeout,
        )?;
        debug!(driver = %key.driver, url, source = %source, "connection factory created");
        factories.insert(key, Arc::clone(&factory));
        Ok(factory)
    }

    /// Factory opening a fresh connection for every lease.
    pub fn per_call(&self, driver: &Arc<dyn Driver>, url: &str) -> Result<Arc<ConnectionFactory>> {
        self.factory(driver, url, ConnectionSource::PerCall)
    }

    /// Bounded pool of `size` connections.
    pub fn pooled(
        &self,
        driver: &Arc<dyn Driver>,
        url: &str,
        size: usize,
    ) -> Result<Arc<ConnectionFactory>> {
        self.factory(driver, url, ConnectionSource::Pooled { size })
    }

    /// One connection shared by every lease.
    pub fn single(&self, driver: &Arc<dyn Driver>, url: &str) -> Result<Arc<ConnectionFactory>> {
        self.factory(driver, url, ConnectionSource::Single)
    }

    /// Path of a temp file holding `catalog`, written on first request.
    pub fn catalog_path(&self, catalog: &str) -> Result<PathBuf> {
        self.ensure_running()?;
        let mut catalogs = self.catalogs.lock();
        if let Some(file) = catalogs.get(catalog) {
            return Ok(file.path().to_path_buf());
        }
        let mut file = tempfile::Builder::new()
            .prefix("tck-catalog-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(catalog.as_bytes())?;
        file.flush()?;
        let path = file.path().to_path_buf();
        debug!(path = %path.display(), bytes = catalog.len(), "catalog written");
        catalogs.insert(catalog.to_owned(), file);
        Ok(path)
    }

    /// Point the first `Catalog=...;` segment of `connect_string` at a temp
    /// file holding `catalog`; appends the segment when there is none.
    pub fn connect_string_for_catalog(&self, connect_string: &str, catalog: &str) -> Result<String> {
        let path = self.catalog_path(catalog)?;
        Ok(replace_catalog(connect_string, &path.display().to_string()))
    }

    pub fn factory_count(&self) -> usize {
        self.factories.lock().len()
    }

    pub fn catalog_count(&self) -> usize {
        self.catalogs.lock().len()
    }

    /// Shut down every factory and delete the catalog files. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return;
            }
            *shut_down = true;
        }
        let factories: Vec<_> = self.factories.lock().drain().map(|(_, f)| f).collect();
        for factory in &factories {
            factory.shutdown();
        }
        let catalogs = std::mem::take(&mut *self.catalogs.lock());
        info!(
            factories = factories.len(),
            catalogs = catalogs.len(),
            "connection factory registry shut down"
        );
    }
}

impl Drop for ConnectionFactoryRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Replace the first `Catalog=...;` segment, or append one.
pub fn replace_catalog(connect_string: &str, catalog_path: &str) -> String {
    let segment = format!("Catalog={catalog_path};");
    if CATALOG_SEGMENT.is_match(connect_string) {
        CATALOG_SEGMENT
            .replace(connect_string, NoExpand(&segment))
            .into_owned()
    } else if connect_string.is_empty() || connect_string.ends_with(';') {
        format!("{connect_string}{segment}")
    } else {
        format!("{connect_string};{segment}")
    }
}
