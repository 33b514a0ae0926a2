//! Centralized naming conventions for per-site infrastructure resources.
//!
//! All components MUST use these functions instead of inline string
//! concatenation. Site identifiers are validated as `^[a-z0-9]+$` before
//! they reach this module, which keeps every derived name safe to embed in
//! SQL identifiers, container names, and file paths.

/// MariaDB database name for a site's application data.
#[must_use]
pub fn app_database(site: &str) -> String {
    format!("wp_{site}")
}

/// MariaDB user that owns the site's application database.
#[must_use]
pub fn app_db_user(site: &str) -> String {
    format!("wp_{site}")
}

/// Deterministic password for the site's database user.
///
/// Derived rather than stored so that a retried provision run reproduces
/// the same credentials the container environment already carries.
#[must_use]
pub fn app_db_password(site: &str) -> String {
    format!("pass_{site}")
}

/// Shared Docker volume mounted by the app container and its sidecar.
#[must_use]
pub fn volume(site: &str) -> String {
    format!("wp_{site}")
}

/// PHP application container name.
#[must_use]
pub fn app_container(site: &str) -> String {
    format!("php_{site}")
}

/// Static-file sidecar container name.
#[must_use]
pub fn sidecar_container(site: &str) -> String {
    format!("nginx_{site}")
}

/// Per-site edge router snippet filename.
#[must_use]
pub fn snippet_file(site: &str) -> String {
    format!("{site}.caddy")
}

/// Default domain for a site under the configured base domain.
#[must_use]
pub fn site_domain(site: &str, base_domain: &str) -> String {
    format!("{site}.{base_domain}")
}

/// Subdirectory of the shared static volume holding a static site's files.
#[must_use]
pub fn static_subdir(site: &str) -> String {
    format!("/srv/sites/{site}")
}

/// Name for the ephemeral container used to copy files into a volume.
#[must_use]
pub fn upload_container(volume: &str) -> String {
    format!("tmp_upload_{volume}")
}
