//! `bansho keys` — create, list, and revoke API keys.

use std::process::ExitCode;

use bansho_security::keys::PostgresCredentialStore;
use bansho_types::{CredentialStore, Settings};

use crate::KeysCommands;

pub async fn run(settings: &Settings, command: KeysCommands) -> anyhow::Result<ExitCode> {
    let pool = crate::db::connect_and_migrate(settings).await?;
    let store = PostgresCredentialStore::new(pool);

    match command {
        KeysCommands::Create { role } => {
            let created = store.create(&role).await?;
            // The cleartext is shown here and never again.
            println!("api_key_id: {}", created.api_key_id);
            println!("api_key: {}", created.api_key);
            Ok(ExitCode::SUCCESS)
        }
        KeysCommands::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No API keys found.");
                return Ok(ExitCode::SUCCESS);
            }
            println!("api_key_id\trole\trevoked");
            for record in records {
                let revoked = if record.revoked { "yes" } else { "no" };
                println!("{}\t{}\t{}", record.api_key_id, record.role, revoked);
            }
            Ok(ExitCode::SUCCESS)
        }
        KeysCommands::Revoke { api_key_id } => {
            if store.revoke(&api_key_id).await? {
                println!("Revoked API key: {api_key_id}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("API key not found or already revoked: {api_key_id}");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
