use std::collections::HashMap;
use std::net::TcpListener;

/// Grabs a port the OS considers free right now. Good enough for tests that
/// bind it again immediately.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind probe socket");
    listener.local_addr().expect("probe socket has no addr").port()
}

pub fn single_node_props(metadata_dir: &str, port: u16) -> HashMap<String, String> {
    let pairs = [
        ("yfs.gateway.local", "n0".to_string()),
        ("yfs.gateway.metadataDir", metadata_dir.to_string()),
        ("yfs.gateway.node[0].id", "n0".to_string()),
        ("yfs.gateway.node[0].ip", "127.0.0.1".to_string()),
        ("yfs.gateway.node[0].socket_port", port.to_string()),
    ];
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
