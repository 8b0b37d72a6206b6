// ABOUTME: Preview port discovery helpers
// ABOUTME: Parses listening ports from the scan pipeline and maps exposable ports to public URLs

use std::collections::{BTreeSet, HashMap};

use crate::types::PreviewLink;

/// Shell pipeline printing one listening TCP/UDP port per line
pub const LISTENING_PORTS_COMMAND: &str =
    "ss -tuln | grep LISTEN | awk '{print $5}' | sed 's/.*://g' | grep -E '^[0-9]+$' | sort -u";

pub const VNC_PORT: u16 = 5900;
pub const VNC_WEBSOCKET_PORT: u16 = 6080;
pub const CHROME_DEVTOOLS_PORT: u16 = 9222;

/// Container ports published to the host and eligible for previews
pub const EXPOSABLE_PORTS: &[u16] = &[
    3000, 3001, 5000, 5900, 6080, 8000, 8080, 8765, 5173, 4200, 8888, 4321, 3030, 5500, 1234, 4000,
];

/// Infrastructure ports that never appear as previews: SSH, model bridge, tooling,
/// VNC, IDE server, and browser devtools.
pub const EXCLUDED_PREVIEW_PORTS: &[u16] = &[
    22,
    3456,
    4040,
    49982,
    49983,
    VNC_PORT,
    VNC_WEBSOCKET_PORT,
    8765,
    CHROME_DEVTOOLS_PORT,
];

pub fn parse_listening_ports(stdout: &str) -> BTreeSet<u16> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u16>().ok())
        .collect()
}

/// Build preview links for every listening port that is exposed and not excluded.
/// `exposed` filters to ports the backend can reach from outside.
pub fn build_preview_links<F>(
    listening: &BTreeSet<u16>,
    exposed: impl Fn(u16) -> bool,
    extra_excluded: &[u16],
    url_for: F,
) -> Vec<PreviewLink>
where
    F: Fn(u16) -> Option<String>,
{
    listening
        .iter()
        .copied()
        .filter(|port| exposed(*port))
        .filter(|port| !EXCLUDED_PREVIEW_PORTS.contains(port) && !extra_excluded.contains(port))
        .filter_map(|port| {
            url_for(port).map(|preview_url| PreviewLink { preview_url, port })
        })
        .collect()
}

/// URL for a sandbox port: wildcard subdomain when a sandbox domain is configured,
/// otherwise the published host port on the preview base URL.
pub fn preview_url(
    sandbox_id: &str,
    port: u16,
    sandbox_domain: Option<&str>,
    preview_base_url: &str,
    port_map: &HashMap<u16, u16>,
) -> Option<String> {
    match sandbox_domain {
        Some(domain) => Some(format!("https://sandbox-{}-{}.{}", sandbox_id, port, domain)),
        None => port_map
            .get(&port)
            .map(|host_port| format!("{}:{}", preview_base_url, host_port)),
    }
}

/// Swap an http(s) base URL for its websocket counterpart.
pub fn websocket_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}
