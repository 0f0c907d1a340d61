//! Reference plugin: a tiny user table driven from the console.
//!
//! Built as a `cdylib`; drop the library into the host's plugins directory
//! and the host swaps it in.

pub mod commands;

use plughost_kernel::{
    PluginEntryPoint, PluginResult, Row, SqlValue, StoreConnection, declare_entry_point,
};

use commands::UserCommand;

pub const LIST_HEADER: &str = "=== User List ===";
pub const LIST_FOOTER: &str = "=========================";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

#[derive(Debug, Default)]
pub struct UsersPlugin;

impl UsersPlugin {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, conn: &mut dyn StoreConnection, command: UserCommand<'_>) -> PluginResult<String> {
        let output = match command {
            UserCommand::Insert {
                name,
                last_name,
                email,
            } => {
                conn.execute(
                    "INSERT INTO users (name, last_name, email) VALUES (?, ?, ?)",
                    &[name.into(), last_name.into(), email.into()],
                )?;
                "User added!".to_string()
            }
            UserCommand::Update {
                id,
                name,
                last_name,
                email,
            } => {
                let changed = conn.execute(
                    "UPDATE users SET name = ?, last_name = ?, email = ? WHERE id = ?",
                    &[name.into(), last_name.into(), email.into(), id.into()],
                )?;
                found(changed, "User updated!")
            }
            UserCommand::Delete { id } => {
                let changed = conn.execute("DELETE FROM users WHERE id = ?", &[id.into()])?;
                found(changed, "User deleted!")
            }
            UserCommand::List => {
                let rows = conn.query(
                    "SELECT id, name, last_name, email, created_at FROM users ORDER BY id",
                    &[],
                )?;
                let mut lines = Vec::with_capacity(rows.len() + 2);
                lines.push(LIST_HEADER.to_string());
                lines.extend(rows.iter().map(describe));
                lines.push(LIST_FOOTER.to_string());
                lines.join("\n")
            }
            UserCommand::Get { id } => {
                let row = conn.query_one(
                    "SELECT id, name, last_name, email, created_at FROM users WHERE id = ?",
                    &[SqlValue::Integer(id)],
                )?;
                match row {
                    Some(row) => describe(&row),
                    None => "User not found!".to_string(),
                }
            }
            UserCommand::Usage(usage) => usage.to_string(),
            UserCommand::Unknown => "Unknown command!".to_string(),
        };
        Ok(output)
    }
}

impl PluginEntryPoint for UsersPlugin {
    fn name(&self) -> &str {
        "users"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn invoke(&self, conn: &mut dyn StoreConnection, command: &str) -> PluginResult<String> {
        let command = commands::parse(command)?;
        conn.execute(SCHEMA, &[])?;
        self.run(conn, command)
    }
}

fn found(changed: u64, message: &str) -> String {
    if changed > 0 {
        message.to_string()
    } else {
        "User not found!".to_string()
    }
}

fn describe(row: &Row) -> String {
    format!(
        "ID: {}, Name: {}, Last Name: {}, Email: {}, CreatedAt: {}",
        row.display("id"),
        row.display("name"),
        row.display("last_name"),
        row.display("email"),
        row.display("created_at"),
    )
}

declare_entry_point!(UsersPlugin, UsersPlugin::new());
