//! Filters available to the HAProxy template.

use minijinja::{Environment, Error, ErrorKind};
use openssl::hash::{MessageDigest, hash};

pub fn register(env: &mut Environment<'static>) {
    env.add_filter("acl_name", acl_name);
    env.add_filter("header_name", header_name);
    env.add_filter("host_name", host_name);
    env.add_filter("host_acls", host_acls);
    env.add_filter("sni_matcher", sni_matcher);
    env.add_filter("backend_hash", backend_hash);
}

/// ACL names may only hold letters, digits, `-`, `_`, `.` and `:`.
pub fn acl_name(v: &str) -> String {
    let v = v.strip_prefix('/').unwrap_or(v);
    let v = v.strip_suffix('/').unwrap_or(v);
    v.replace('/', "-").replace('*', ".")
}

/// First token of a `Name value` header spec; empty when there is no value.
pub fn header_name(v: &str) -> String {
    let v = v.trim();
    match v.find(' ') {
        Some(i) => v[..i].to_string(),
        None => String::new(),
    }
}

pub fn host_name(v: &str) -> String {
    match v.strip_prefix('*') {
        Some(suffix) => format!("hdr_end(host) -i {suffix}"),
        None => format!("hdr(host) -i {v}"),
    }
}

/// Host header conditions for a frontend port. Standard ports also match
/// the bare host.
pub fn host_acls(host: &str, port: u16) -> Vec<String> {
    let host = host.trim();
    if host.is_empty() || host == "*" {
        return vec![];
    }
    let with_port = host_name(&format!("{host}:{port}"));
    if port == 80 || port == 443 {
        vec![host_name(host), with_port]
    } else {
        vec![with_port]
    }
}

pub fn sni_matcher(host: &str, offload_ssl: bool) -> String {
    match (host.strip_prefix('*'), offload_ssl) {
        (Some(suffix), true) => format!("ssl_fc_sni_end -i {suffix}"),
        (None, true) => format!("ssl_fc_sni -i {host}"),
        (Some(suffix), false) => format!("req_ssl_sni -i -m end {suffix}"),
        (None, false) => format!("req_ssl_sni -i {host}"),
    }
}

/// Sticky cookie value for a server.
pub fn backend_hash(value: &str, index: usize, mode: &str) -> Result<String, Error> {
    let digest = match mode {
        "md5" => MessageDigest::md5(),
        "sha" => MessageDigest::sha512(),
        "index" => return Ok((index + 1).to_string()),
        _ => return Ok(value.to_string()),
    };
    let sum = hash(digest, value.as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    Ok(openssl::base64::encode_block(&sum))
}
