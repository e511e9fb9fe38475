use fleet_common::ApiMode;

use super::shell_arg::{OpaquePayload, ShellArg};

/// Gateway port the runtime listens on; part of the prebaked image contract.
pub const GATEWAY_PORT: u16 = 8787;
/// Local control-plane port used by `agentctl` on the VM itself.
pub const CONTROL_PORT: u16 = 8788;

pub const STATE_DIR: &str = "/opt/agentd/state";
pub const SYSTEM_PROMPT_PATH: &str = "/opt/agentd/state/SYSTEM.md";
pub const HEARTBEAT_PATH: &str = "/opt/agentd/state/HEARTBEAT.md";

/// Marker the final script emits; a configure run without it is a failure
/// no matter what the exit code says.
pub const DONE_MARKER: &str = "::configure::done";

/// Mint a random credential with a recognizable prefix ("gw_" for gateway
/// auth, "fgw_" for the proxied-mode upstream token).
pub fn mint_token(prefix: &str) -> String {
    format!("{prefix}{:032x}", rand::random::<u128>())
}

/// Step 1: stop any running runtime and clear stale pairing state so a
/// re-run starts from a clean slate.
pub fn stop_runtime_script() -> String {
    format!(
        "set -e\n\
         echo ::phase::stop_runtime\n\
         pkill -f agentd || true\n\
         sleep 1\n\
         rm -rf {STATE_DIR}/pairing\n\
         rm -f /tmp/agentd.log\n"
    )
}

/// Step 2: non-interactive onboarding. In byok mode the customer's own key
/// becomes the upstream credential; in proxied mode a freshly minted local
/// token does, and the real key never reaches the VM.
pub fn onboard_script(
    api_mode: ApiMode,
    upstream_key: &ShellArg,
    gateway_token: &ShellArg,
) -> String {
    let mode = match api_mode {
        ApiMode::Byok => "byok",
        ApiMode::Proxied => "proxied",
    };
    format!(
        "set -e\n\
         echo ::phase::onboard\n\
         agentctl onboard --non-interactive \
           --mode {mode} \
           --api-key {upstream_key} \
           --gateway-port {GATEWAY_PORT} \
           --gateway-token {gateway_token}\n"
    )
}

/// Step 3, once per channel: write the token and enable the plugin.
pub fn channel_script(kind: &ShellArg, plugin: &ShellArg, token: &ShellArg) -> String {
    format!(
        "set -e\n\
         echo ::phase::channel_{kind}\n\
         agentctl config set channels.{kind}.token {token}\n\
         agentctl plugins enable {plugin}\n"
    )
}

/// Step 4 (proxied only): point the credential profile at the metering proxy.
pub fn proxy_base_url_script(proxy_url: &ShellArg) -> String {
    format!(
        "set -e\n\
         echo ::phase::proxy_base_url\n\
         agentctl config set api.base_url {proxy_url}\n"
    )
}

/// Step 5: model selection and heartbeat cadence, plus the optional
/// web-search key.
pub fn model_script(model: &ShellArg, heartbeat_secs: u32, search_key: Option<&ShellArg>) -> String {
    let mut script = format!(
        "set -e\n\
         echo ::phase::model\n\
         agentctl config set agent.model {model}\n\
         agentctl config set agent.heartbeat_interval_secs {heartbeat_secs}\n"
    );
    if let Some(key) = search_key {
        script.push_str(&format!("agentctl config set tools.search.api_key {key}\n"));
    }
    script
}

/// Free-form content crosses the wire base64-encoded; the raw text never
/// appears on a command line. Destinations are fixed paths owned by this
/// module, never caller input.
fn write_payload(payload: &OpaquePayload, dest: &str) -> String {
    format!("printf '%s' '{}' | base64 -d > {dest}", payload.encoded())
}

/// Step 6: marketplace plugin, starter heartbeat task list, default system
/// prompt. The prompt write is guarded so a customer's own edit survives a
/// re-run; the seed memory write is guarded the same way.
pub fn workspace_script(
    heartbeat: &OpaquePayload,
    system_prompt: &OpaquePayload,
    seed_memory: Option<&OpaquePayload>,
) -> String {
    let mut script = format!(
        "set -e\n\
         echo ::phase::workspace\n\
         agentctl plugins enable fleet-marketplace\n\
         mkdir -p {STATE_DIR}\n\
         {write_heartbeat}\n\
         if test ! -f {SYSTEM_PROMPT_PATH}; then\n\
           {write_prompt}\n\
         fi\n",
        write_heartbeat = write_payload(heartbeat, HEARTBEAT_PATH),
        write_prompt = write_payload(system_prompt, SYSTEM_PROMPT_PATH),
    );
    if let Some(memory) = seed_memory {
        script.push_str(&format!(
            "if test ! -f {STATE_DIR}/MEMORY.md; then\n\
               {write_memory}\n\
             fi\n",
            write_memory = write_payload(memory, &format!("{STATE_DIR}/MEMORY.md")),
        ));
    }
    script
}

/// Step 7a: start the runtime detached. The done marker only prints once the
/// process is confirmed up.
pub fn start_runtime_script() -> String {
    format!(
        "set -e\n\
         echo ::phase::start_runtime\n\
         nohup agentd --port {GATEWAY_PORT} --control-port {CONTROL_PORT} \
           > /tmp/agentd.log 2>&1 &\n\
         sleep 3\n\
         pgrep -f agentd > /dev/null\n\
         echo {DONE_MARKER}\n"
    )
}

/// Step 7b: pending pairing requests, one "::pairing::<id>" line each.
pub fn pairing_list_script() -> String {
    "agentctl pairing list --ids-only | while read -r id; do echo \"::pairing::$id\"; done\n"
        .to_string()
}

pub fn pairing_approve_script(request_id: &ShellArg) -> String {
    format!(
        "set -e\n\
         echo ::phase::pairing_approve\n\
         agentctl pairing approve {request_id}\n"
    )
}

/// Step 7c: restart so the approval takes effect.
pub fn restart_runtime_script() -> String {
    format!(
        "set -e\n\
         echo ::phase::restart_runtime\n\
         pkill -f agentd || true\n\
         sleep 1\n\
         nohup agentd --port {GATEWAY_PORT} --control-port {CONTROL_PORT} \
           > /tmp/agentd.log 2>&1 &\n\
         sleep 2\n\
         pgrep -f agentd > /dev/null\n"
    )
}

/// Step 8: Caddy reverse proxy with automatic TLS for the per-VM hostname.
pub fn caddy_tls_script(hostname: &ShellArg) -> String {
    format!(
        "set -e\n\
         echo ::phase::tls\n\
         printf '%s {{\\n  reverse_proxy localhost:{GATEWAY_PORT}\\n}}\\n' {hostname} \
           | sudo tee /etc/caddy/Caddyfile > /dev/null\n\
         sudo systemctl reload caddy || sudo systemctl restart caddy\n\
         sleep 2\n\
         systemctl is-active --quiet caddy\n"
    )
}

/// Parse "::pairing::<id>" lines out of a pairing-list run.
pub fn extract_pairing_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("::pairing::"))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_carry_prefix_and_validate_as_shell_args() {
        let t = mint_token("fgw_");
        assert!(t.starts_with("fgw_"));
        assert!(t.len() > 20);
        assert!(ShellArg::new(&t).is_ok());
        assert_ne!(mint_token("gw_"), mint_token("gw_"));
    }

    #[test]
    fn onboard_script_names_the_mode() {
        let key = ShellArg::new("sk-customer-key").unwrap();
        let tok = ShellArg::new("gw_abc123").unwrap();
        let byok = onboard_script(ApiMode::Byok, &key, &tok);
        assert!(byok.contains("--mode byok"));
        assert!(byok.contains("sk-customer-key"));
        let proxied = onboard_script(ApiMode::Proxied, &key, &tok);
        assert!(proxied.contains("--mode proxied"));
    }

    #[test]
    fn prompt_write_is_guarded_against_overwrite() {
        let hb = OpaquePayload::new("- check inbox\n");
        let prompt = OpaquePayload::new("You are a helpful agent.");
        let script = workspace_script(&hb, &prompt, None);
        assert!(script.contains("test ! -f /opt/agentd/state/SYSTEM.md"));
        // The raw prompt text never appears in the command line.
        assert!(!script.contains("helpful agent"));
    }

    #[test]
    fn seed_memory_is_optional() {
        let hb = OpaquePayload::new("- tasks\n");
        let prompt = OpaquePayload::new("prompt");
        assert!(!workspace_script(&hb, &prompt, None).contains("MEMORY.md"));
        let memory = OpaquePayload::new("remembers things");
        assert!(workspace_script(&hb, &prompt, Some(&memory)).contains("MEMORY.md"));
    }

    #[test]
    fn pairing_ids_parse() {
        let out = "noise\n::pairing::req-17\n::pairing::  \n::pairing::req-18\n";
        assert_eq!(extract_pairing_ids(out), vec!["req-17", "req-18"]);
    }

    #[test]
    fn start_script_ends_with_done_marker() {
        assert!(start_runtime_script().trim_end().ends_with(DONE_MARKER));
    }
}
