//! Boot-stage artifact composition.
//!
//! Stage-1 artifacts carry everything a machine needs to progress through
//! the rest of its boot: the chain URL for the next loader plus absolute,
//! session-scoped URLs for stage2, stage3, report and any enabled
//! extensions. Stage-2/3 artifacts are minimal chain documents. All
//! emission is deterministic given a host record and the public server
//! name.

use std::fmt::Write;

use crate::action::{Action, V1};
use crate::host::{Host, STAGE1_IPXE, STAGE1_JSON};

/// Builds the absolute URL for one session-scoped boot target.
fn stage_url(server_name: &str, host_name: &str, session_id: &str, target: &str) -> String {
    format!("https://{server_name}/v1/boot/{host_name}/{session_id}/{target}")
}

/// Builds the absolute URL for one extension operation.
fn extension_url(server_name: &str, host_name: &str, session_id: &str, operation: &str) -> String {
    format!("https://{server_name}/v1/boot/{host_name}/{session_id}/extension/{operation}")
}

/// Renders the stage-1 iPXE script for `host`.
///
/// The script publishes the chain URL of the selected sequence and the
/// session-scoped URLs as iPXE variables, then chains. The
/// `images_version` line is omitted when the host carries no version tag.
#[must_use]
pub fn stage1_ipxe_script(host: &Host, server_name: &str) -> String {
    let sequence = host.current_sequence();
    let ids = &host.current_session_ids;

    let mut script = String::from("#!ipxe\n\n");
    let chain_url = sequence.get(STAGE1_IPXE).map_or("", String::as_str);
    let _ = writeln!(script, "set stage1chain_url {chain_url}");
    let _ = writeln!(
        script,
        "set stage2_url {}",
        stage_url(server_name, &host.name, &ids.stage2, "stage2")
    );
    let _ = writeln!(
        script,
        "set stage3_url {}",
        stage_url(server_name, &host.name, &ids.stage3, "stage3")
    );
    let _ = writeln!(
        script,
        "set report_url {}",
        stage_url(server_name, &host.name, &ids.report, "report")
    );
    if !host.images_version.is_empty() {
        let _ = writeln!(script, "set images_version {}", host.images_version);
    }
    for operation in &host.extensions {
        let _ = writeln!(
            script,
            "set {operation}_url {}",
            extension_url(server_name, &host.name, &ids.extension, operation)
        );
    }
    script.push_str("\nchain ${stage1chain_url}\n");
    script
}

/// Renders the stage-1 action document for native clients.
///
/// The same information as the iPXE script, expressed as kernel arguments a
/// client merges into its own set, with the chain pointing at the selected
/// sequence's `stage1.json` entry.
#[must_use]
pub fn stage1_action(host: &Host, server_name: &str) -> Action {
    let sequence = host.current_sequence();
    let ids = &host.current_session_ids;

    let mut action = Action::default();
    action.kargs.insert(
        "epoxy.stage2".to_string(),
        stage_url(server_name, &host.name, &ids.stage2, "stage2"),
    );
    action.kargs.insert(
        "epoxy.stage3".to_string(),
        stage_url(server_name, &host.name, &ids.stage3, "stage3"),
    );
    action.kargs.insert(
        "epoxy.report".to_string(),
        stage_url(server_name, &host.name, &ids.report, "report"),
    );
    if !host.images_version.is_empty() {
        action
            .kargs
            .insert("epoxy.images_version".to_string(), host.images_version.clone());
    }
    for operation in &host.extensions {
        action.kargs.insert(
            format!("epoxy.{operation}"),
            extension_url(server_name, &host.name, &ids.extension, operation),
        );
    }
    action.v1 = Some(V1 {
        chain: sequence.get(STAGE1_JSON).cloned().unwrap_or_default(),
        ..V1::default()
    });
    action
}

/// Renders the minimal action document for a named stage: only the chain URL
/// from the selected sequence.
#[must_use]
pub fn stage_action(host: &Host, stage: &str) -> Action {
    Action {
        v1: Some(V1 {
            chain: host.current_sequence().get(stage).cloned().unwrap_or_default(),
            ..V1::default()
        }),
        ..Action::default()
    }
}

#[cfg(test)]
mod tests {
    use crate::host::{STAGE2, STAGE3, Sequence};

    use super::*;

    fn test_host() -> Host {
        let mut boot = Sequence::new();
        boot.insert(STAGE1_IPXE.to_string(), "https://s/stage1to2.ipxe".to_string());
        boot.insert(STAGE1_JSON.to_string(), "https://s/stage1to2.json".to_string());
        boot.insert(STAGE2.to_string(), "https://s/s2.json".to_string());
        boot.insert(STAGE3.to_string(), "https://s/s3.json".to_string());
        let mut host = Host {
            name: "m1.example.org".to_string(),
            ipv4: "10.0.0.2".to_string(),
            boot,
            extensions: vec!["allocate_k8s_token".to_string()],
            ..Host::default()
        };
        host.current_session_ids.stage2 = "SID2".to_string();
        host.current_session_ids.stage3 = "SID3".to_string();
        host.current_session_ids.report = "SIDR".to_string();
        host.current_session_ids.extension = "SIDE".to_string();
        host
    }

    #[test]
    fn ipxe_script_has_required_shape() {
        let script = stage1_ipxe_script(&test_host(), "boot.example.org");
        assert!(script.starts_with("#!ipxe\n"));
        assert!(script.contains("set stage1chain_url https://s/stage1to2.ipxe\n"));
        assert!(script.contains(
            "set stage2_url https://boot.example.org/v1/boot/m1.example.org/SID2/stage2\n"
        ));
        assert!(script.contains(
            "set stage3_url https://boot.example.org/v1/boot/m1.example.org/SID3/stage3\n"
        ));
        assert!(script.contains(
            "set report_url https://boot.example.org/v1/boot/m1.example.org/SIDR/report\n"
        ));
        assert!(script.contains(
            "set allocate_k8s_token_url https://boot.example.org/v1/boot/m1.example.org/SIDE/extension/allocate_k8s_token\n"
        ));
        assert!(script.ends_with("\nchain ${stage1chain_url}\n"));
    }

    #[test]
    fn ipxe_script_omits_empty_images_version() {
        let mut host = test_host();
        assert!(!stage1_ipxe_script(&host, "s").contains("images_version"));
        host.images_version = "v2.3".to_string();
        assert!(stage1_ipxe_script(&host, "s").contains("set images_version v2.3\n"));
    }

    #[test]
    fn stage1_action_carries_epoxy_kargs() {
        let mut host = test_host();
        host.images_version = "v2.3".to_string();
        let action = stage1_action(&host, "boot.example.org");
        let kargs = &action.kargs;
        assert_eq!(
            kargs.get("epoxy.stage2").map(String::as_str),
            Some("https://boot.example.org/v1/boot/m1.example.org/SID2/stage2")
        );
        assert_eq!(
            kargs.get("epoxy.report").map(String::as_str),
            Some("https://boot.example.org/v1/boot/m1.example.org/SIDR/report")
        );
        assert_eq!(kargs.get("epoxy.images_version").map(String::as_str), Some("v2.3"));
        assert_eq!(
            kargs.get("epoxy.allocate_k8s_token").map(String::as_str),
            Some(
                "https://boot.example.org/v1/boot/m1.example.org/SIDE/extension/allocate_k8s_token"
            )
        );
        assert_eq!(action.chain(), "https://s/stage1to2.json");
    }

    #[test]
    fn stage_action_is_minimal_chain() {
        let action = stage_action(&test_host(), STAGE2);
        assert_eq!(
            serde_json::to_string(&action).unwrap(),
            r#"{"v1":{"chain":"https://s/s2.json"}}"#
        );
    }

    #[test]
    fn update_sequence_selected_when_enabled() {
        let mut host = test_host();
        host.update
            .insert(STAGE2.to_string(), "https://s/u2.json".to_string());
        host.update_enabled = true;
        let action = stage_action(&host, STAGE2);
        assert_eq!(action.chain(), "https://s/u2.json");
    }

    #[test]
    fn unknown_stage_yields_empty_chain() {
        let action = stage_action(&test_host(), "stage9");
        assert_eq!(action.chain(), "");
    }
}
