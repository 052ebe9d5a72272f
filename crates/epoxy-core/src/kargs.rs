//! Kernel command-line parsing.
//!
//! A kernel command line is a whitespace-separated list of parameters. Each
//! parameter is split on the first `=`: the left side becomes the key and the
//! right side the value. A parameter without `=` becomes a key with an empty
//! value. Values are kept byte-for-byte; characters like `?`, `&` and further
//! `=` signs are part of the value, so URLs survive intact.

use std::collections::BTreeMap;

/// Parsed kernel arguments, keyed by parameter name.
pub type Kargs = BTreeMap<String, String>;

/// Parses a kernel command line into a key/value map.
///
/// The input is trimmed before splitting, so a trailing newline from
/// `/proc/cmdline` is harmless. Keys may contain `-` and `.`; no unescaping
/// is performed.
#[must_use]
pub fn parse(cmdline: &str) -> Kargs {
    let mut kargs = Kargs::new();
    for param in cmdline.trim().split_whitespace() {
        match param.split_once('=') {
            Some((key, value)) => {
                kargs.insert(key.to_string(), value.to_string());
            },
            None => {
                // A flag-style parameter, e.g. "ro" or "quiet".
                kargs.insert(param.to_string(), String::new());
            },
        }
    }
    kargs
}

/// Serializes a karg map back into a canonical command line.
///
/// Keys are emitted in sorted order. Flag-style parameters (empty value) are
/// emitted without `=`, so `parse(serialize(m)) == m` for any parsed map.
#[must_use]
pub fn serialize(kargs: &Kargs) -> String {
    let mut params = Vec::with_capacity(kargs.len());
    for (key, value) in kargs {
        if value.is_empty() {
            params.push(key.clone());
        } else {
            params.push(format!("{key}={value}"));
        }
    }
    params.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_equals() {
        let kargs = parse("epoxy.stage2=https://boot.example.org/v1/boot/m1/abc/stage2");
        assert_eq!(
            kargs.get("epoxy.stage2").map(String::as_str),
            Some("https://boot.example.org/v1/boot/m1/abc/stage2")
        );
    }

    #[test]
    fn parse_keeps_query_strings_whole() {
        let kargs = parse("url=http://x?a=b&c=d");
        assert_eq!(kargs.len(), 1);
        assert_eq!(kargs.get("url").map(String::as_str), Some("http://x?a=b&c=d"));
    }

    #[test]
    fn parse_flag_parameter_gets_empty_value() {
        let kargs = parse("ro quiet epoxy.images_version=v2.3");
        assert_eq!(kargs.get("ro").map(String::as_str), Some(""));
        assert_eq!(kargs.get("quiet").map(String::as_str), Some(""));
        assert_eq!(kargs.get("epoxy.images_version").map(String::as_str), Some("v2.3"));
    }

    #[test]
    fn parse_trims_surrounding_whitespace() {
        let kargs = parse("  console=ttyS0 net.ifnames=0 \n");
        assert_eq!(kargs.len(), 2);
        assert_eq!(kargs.get("console").map(String::as_str), Some("ttyS0"));
    }

    #[test]
    fn parse_accepts_dashes_and_dots_in_keys() {
        let kargs = parse("ide-core.nodma=0.1");
        assert_eq!(kargs.get("ide-core.nodma").map(String::as_str), Some("0.1"));
    }

    #[test]
    fn parse_ipv4_config_value() {
        let kargs = parse("epoxy.net_ipv4=192.168.0.2/24,192.168.0.1,8.8.8.8,8.8.4.4");
        assert_eq!(
            kargs.get("epoxy.net_ipv4").map(String::as_str),
            Some("192.168.0.2/24,192.168.0.1,8.8.8.8,8.8.4.4")
        );
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let kargs = parse("ro epoxy.stage2=https://s/x?a=b quiet console=ttyS0");
        let reparsed = parse(&serialize(&kargs));
        assert_eq!(kargs, reparsed);
    }

    #[test]
    fn parse_empty_cmdline() {
        assert!(parse("").is_empty());
        assert!(parse("  \n").is_empty());
    }
}
