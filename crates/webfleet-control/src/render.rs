//! Rendering of per-site edge snippets and sidecar server blocks.
//!
//! The rendered text is a deployment artifact, not a stable contract; the
//! only pattern other components rely on is the hostname header:
//! `<site>.<base>` alone, or `<site>.<base>, <custom>` when a custom
//! domain is attached. Keeping every renderer in this module keeps that
//! pattern in one place.

use webfleet_core::naming;

/// Hostname header for an edge snippet.
fn edge_hosts(default_domain: &str, custom_domain: Option<&str>) -> String {
    match custom_domain {
        Some(custom) if !custom.is_empty() => format!("{default_domain}, {custom}"),
        _ => default_domain.to_owned(),
    }
}

/// Edge snippet for a WordPress site: route both hostnames to the site's
/// sidecar, which serves static files and forwards PHP upstream.
#[must_use]
pub fn edge_snippet_wordpress(
    site: &str,
    default_domain: &str,
    custom_domain: Option<&str>,
) -> String {
    let hosts = edge_hosts(default_domain, custom_domain);
    let sidecar = naming::sidecar_container(site);

    format!(
        "{hosts} {{\n    encode gzip\n    reverse_proxy {sidecar}:80\n}}\n"
    )
}

/// Edge snippet for a static site: serve the site's subdirectory of the
/// shared static volume directly from the edge.
#[must_use]
pub fn edge_snippet_static(
    site: &str,
    default_domain: &str,
    custom_domain: Option<&str>,
) -> String {
    let hosts = edge_hosts(default_domain, custom_domain);
    let root = naming::static_subdir(site);

    format!(
        "{hosts} {{\n    root * {root}\n    file_server\n    encode gzip\n}}\n"
    )
}

/// Sidecar server block for a WordPress site.
///
/// Serves static files from the shared volume and forwards PHP requests to
/// the application container. `$host` is passed through unchanged, so the
/// application sees whichever hostname the edge accepted.
#[must_use]
pub fn sidecar_server_block(
    site: &str,
    default_domain: &str,
    custom_domain: Option<&str>,
) -> String {
    let server_names = match custom_domain {
        Some(custom) if !custom.is_empty() => format!("{default_domain} {custom}"),
        _ => default_domain.to_owned(),
    };
    let app = naming::app_container(site);

    format!(
        r#"server {{
    listen 80;
    server_name {server_names};
    root /var/www/html;
    index index.php;

    location / {{
        try_files $uri $uri/ /index.php?$args;
    }}

    location ~ \.php$ {{
        fastcgi_pass {app}:9000;
        fastcgi_index index.php;
        include fastcgi_params;
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_param HTTP_HOST $host;
    }}
}}
"#
    )
}
