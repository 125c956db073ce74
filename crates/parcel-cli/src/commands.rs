use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use parcel_crypto::{generate_fingerprint, Engine};
use parcel_protocol::codec::{decode_b64, decode_record, encode_record};
use tracing::info;

use crate::Command;

/// Use `value` if given, otherwise read all of stdin.
fn arg_or_stdin(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(value) => Ok(value),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .with_context(|| format!("failed to read {what} from stdin"))?;
            Ok(buf.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

fn file_or_stdin(path: Option<&Path>, what: &str) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {what}: {}", path.display())),
        None => arg_or_stdin(None, what),
    }
}

pub async fn run(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            let me = engine.identity().require_active().await?;
            println!("key id:      {}", me.id);
            println!("public key:  {}", me.public_key_b64());
            println!("fingerprint: {}", generate_fingerprint(&me.public_key));
        }

        Command::Fingerprint => {
            let data = engine.own_verification_data().await?;
            println!("fingerprint: {}", data.fingerprint);
            println!("short:       {}", data.short_fingerprint);
            println!("payload:     {}", data.payload_json);
        }

        Command::Encrypt {
            peer_id,
            peer_key,
            message,
        } => {
            let peer_key = decode_b64("peer key", &peer_key).context("invalid peer public key")?;
            let message = arg_or_stdin(message, "message")?;
            let record = engine
                .encrypt_as_active(&message, &peer_key, &peer_id)
                .await
                .with_context(|| format!("failed to encrypt for {peer_id}"))?;
            println!("{}", encode_record(&record)?);
        }

        Command::Decrypt { sender_id, record } => {
            let json = arg_or_stdin(record, "record")?;
            let record = decode_record(&json).context("invalid record")?;
            let plaintext = engine.decrypt_as_active(&record, &sender_id).await?;
            println!("{plaintext}");
        }

        Command::ExportBackup { password, out } => {
            let blob = engine.backup().export_keys_for_backup(&password).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, format!("{blob}\n"))
                        .with_context(|| format!("failed to write backup: {}", path.display()))?;
                    info!(path = %path.display(), "backup written");
                }
                None => println!("{blob}"),
            }
        }

        Command::ImportBackup { password, file } => {
            let blob = file_or_stdin(file.as_deref(), "backup")?;
            let pair = engine
                .backup()
                .import_keys_from_backup(&blob, &password)
                .await?;
            println!("restored key {}", pair.id);
        }

        Command::Verify {
            payload,
            expected_key,
        } => {
            let result = engine.verify_qr_code(&payload, &expected_key);
            match result.error {
                None if result.valid => println!("verified"),
                Some(reason) => bail!("verification failed: {reason}"),
                None => bail!("verification failed"),
            }
        }

        Command::Sweep => {
            let removed = engine.sessions().delete_expired_sessions().await?;
            println!("removed {removed} expired session(s)");
        }

        Command::Rotate => {
            let pair = engine.identity().rotate_identity_keys().await?;
            println!("new key id:  {}", pair.id);
            println!("fingerprint: {}", generate_fingerprint(&pair.public_key));
        }

        Command::Status => {
            for pair in engine.identity().key_history().await? {
                println!(
                    "{} {} created={} label={}",
                    if pair.is_active { "*" } else { " " },
                    pair.id,
                    pair.created_at,
                    pair.device_label.as_deref().unwrap_or("-"),
                );
            }
            let due = engine.sessions().sessions_due_for_rotation().await?;
            if !due.is_empty() {
                println!("rotation due for: {}", due.join(", "));
            }
        }

        Command::Label { id, label } => {
            engine.identity().set_device_label(&id, label).await?;
            println!("updated {id}");
        }
    }
    Ok(())
}
