use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{alerts, logger, shell};

const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
/// Backups kept per VM; everything older is pruned.
const KEEP_PER_VM: usize = 7;
const STATE_DIR: &str = "/opt/agentd/state";

#[derive(Debug, Serialize)]
pub struct BackupSummary {
    pub attempted: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub pruned: i64,
}

/// Object-key-safe rendition of a VM name.
pub fn sanitize_object_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "vm".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Which of the recorded backups to prune, given rows ordered newest first
/// (`created_at DESC, id DESC`): everything past the first KEEP_PER_VM.
pub fn prune_selection<T: Clone>(rows_newest_first: &[T]) -> Vec<T> {
    rows_newest_first
        .iter()
        .skip(KEEP_PER_VM)
        .cloned()
        .collect()
}

async fn s3_client() -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Ok(endpoint) = std::env::var("FLEET_S3_ENDPOINT") {
        loader = loader.endpoint_url(endpoint);
    }
    let config = loader.load().await;
    let mut builder = aws_sdk_s3::config::Builder::from(&config);
    // Path-style addressing for MinIO-compatible endpoints.
    if std::env::var("FLEET_S3_ENDPOINT").is_ok() {
        builder = builder.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}

/// Archive one VM's state directory and ship it to object storage.
async fn backup_vm(
    db: &Pool<Postgres>,
    s3: &aws_sdk_s3::Client,
    bucket: &str,
    vm_id: Uuid,
    name: &str,
    ip: &str,
    ssh_port: i32,
    ssh_user: &str,
) -> anyhow::Result<String> {
    let target = shell::SshTarget::new(ip, ssh_port, ssh_user);
    let archive = format!("/tmp/backup-{}.tar.gz", vm_id);

    let tar_script = format!(
        "set -e\ntar -czf {archive} -C {} .\n",
        STATE_DIR
    );
    let out = shell::run_script(&target, &tar_script, ARCHIVE_TIMEOUT).await?;
    if !out.status.success() {
        anyhow::bail!(
            "archive step failed: {}",
            shell::tail_str(&String::from_utf8_lossy(&out.stderr), 300)
        );
    }

    // Stream the archive back over the same channel; no scp round trip and
    // no second copy on the orchestrator disk.
    let out = shell::run_command(&target, &format!("cat {archive}"), TRANSFER_TIMEOUT).await?;
    if !out.status.success() || out.stdout.is_empty() {
        anyhow::bail!("archive transfer produced no data");
    }
    let size_bytes = out.stdout.len() as i64;

    let key = format!(
        "backups/{}/{}.tar.gz",
        sanitize_object_name(name),
        Utc::now().format("%Y-%m-%dT%H-%M-%SZ")
    );
    s3.put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from(out.stdout))
        .send()
        .await?;

    // Local cleanup is best effort; /tmp clears itself eventually.
    let _ = shell::run_script(
        &target,
        &format!("rm -f {archive}\n"),
        Duration::from_secs(15),
    )
    .await;

    sqlx::query("INSERT INTO backups (vm_id, storage_path, size_bytes) VALUES ($1, $2, $3)")
        .bind(vm_id)
        .bind(&key)
        .bind(size_bytes)
        .execute(db)
        .await?;

    Ok(key)
}

/// Drop everything past the newest KEEP_PER_VM backups, removing the remote
/// object and the metadata row together. Failures are logged and skipped.
async fn prune_vm(
    db: &Pool<Postgres>,
    s3: &aws_sdk_s3::Client,
    bucket: &str,
    vm_id: Uuid,
) -> i64 {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        "SELECT id, storage_path FROM backups
         WHERE vm_id = $1
         ORDER BY created_at DESC, id DESC",
    )
    .bind(vm_id)
    .fetch_all(db)
    .await
    .unwrap_or_default();

    let mut pruned = 0;
    for (backup_id, storage_path) in prune_selection(&rows) {
        if let Err(e) = s3
            .delete_object()
            .bucket(bucket)
            .key(&storage_path)
            .send()
            .await
        {
            eprintln!(
                "⚠️  [backup] prune: object delete failed for {}: {}",
                storage_path, e
            );
            continue;
        }
        match sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(backup_id)
            .execute(db)
            .await
        {
            Ok(_) => pruned += 1,
            Err(e) => eprintln!("⚠️  [backup] prune: row delete failed for {}: {}", backup_id, e),
        }
    }
    pruned
}

/// Scheduled pass: back up every assigned VM's state directory.
pub async fn run(db: &Pool<Postgres>) -> BackupSummary {
    let bucket = match std::env::var("FLEET_BACKUP_BUCKET") {
        Ok(b) => b,
        Err(_) => {
            eprintln!("⚠️  [backup] FLEET_BACKUP_BUCKET not set, skipping run");
            return BackupSummary {
                attempted: 0,
                succeeded: 0,
                failed: 0,
                pruned: 0,
            };
        }
    };

    let rows: Vec<(Uuid, String, Option<String>, i32, String)> = sqlx::query_as(
        "SELECT id, name, ip_address::text, ssh_port, ssh_user FROM vms
         WHERE status = 'assigned'
         ORDER BY created_at ASC",
    )
    .fetch_all(db)
    .await
    .unwrap_or_default();

    let mut summary = BackupSummary {
        attempted: rows.len() as i64,
        succeeded: 0,
        failed: 0,
        pruned: 0,
    };
    if rows.is_empty() {
        return summary;
    }

    println!("💾 [backup] backing up {} assigned VM(s)", rows.len());
    let s3 = s3_client().await;
    let mut failures: Vec<String> = Vec::new();

    for (vm_id, name, ip, ssh_port, ssh_user) in rows {
        let Some(ip) = ip else {
            failures.push(format!("{name}: no ip address"));
            summary.failed += 1;
            continue;
        };

        let start = std::time::Instant::now();
        match backup_vm(db, &s3, &bucket, vm_id, &name, &ip, ssh_port, &ssh_user).await {
            Ok(key) => {
                summary.succeeded += 1;
                let dur = start.elapsed().as_millis() as i32;
                let lid = logger::log_event_with_metadata(
                    db,
                    "VM_BACKUP",
                    "in_progress",
                    vm_id,
                    None,
                    Some(serde_json::json!({ "storage_path": key })),
                )
                .await
                .ok();
                if let Some(lid) = lid {
                    let _ = logger::log_event_complete(db, lid, "success", dur, None).await;
                }
                summary.pruned += prune_vm(db, &s3, &bucket, vm_id).await;
            }
            Err(e) => {
                // One bad VM never aborts the batch.
                let msg = format!("{name}: {e}");
                eprintln!("❌ [backup] {}", msg);
                let _ = logger::log_event(db, "VM_BACKUP", "failed", vm_id, Some(&msg)).await;
                failures.push(msg);
                summary.failed += 1;
            }
        }
    }

    if !failures.is_empty() {
        let msg = format!(
            "backup run finished with {} failure(s): {}",
            failures.len(),
            failures.join("; ")
        );
        alerts::notify_operator(&msg).await;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_key_safe() {
        assert_eq!(sanitize_object_name("agentvm-12"), "agentvm-12");
        assert_eq!(sanitize_object_name("agent vm/12"), "agent-vm-12");
        assert_eq!(sanitize_object_name("///"), "vm");
        assert_eq!(sanitize_object_name("üvm#1"), "vm-1");
    }

    #[test]
    fn prune_keeps_the_seven_newest() {
        let rows: Vec<i32> = (0..10).collect(); // newest first
        assert_eq!(prune_selection(&rows), vec![7, 8, 9]);
        let few: Vec<i32> = (0..7).collect();
        assert!(prune_selection(&few).is_empty());
        assert!(prune_selection::<i32>(&[]).is_empty());
    }
}
