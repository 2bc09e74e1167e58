use std::{collections::HashMap, sync::Arc};

use keel_common::{
    model::{Command, CommandStatus},
    time::now_unix,
};

use super::Collection;
use crate::{
    datastore::{DataStore, Direction, Kind, ListOptions},
    error::{KeelDatabaseError, KeelDatabaseResult},
    filestore::FileStore,
};

#[derive(Clone)]
pub struct CommandStore {
    collection: Collection<Command>,
    fs: Arc<dyn FileStore>,
}

pub fn command_output_path(command_id: &str) -> String {
    format!("command-output/{}.txt", command_id)
}

impl CommandStore {
    pub fn new(ds: Arc<dyn DataStore>, fs: Arc<dyn FileStore>) -> Self {
        Self {
            collection: Collection::new(ds, Kind::Command),
            fs,
        }
    }

    pub async fn get(&self, id: &str) -> KeelDatabaseResult<Command> {
        self.collection.get(id).await
    }

    pub async fn create(&self, command: &Command) -> KeelDatabaseResult {
        if command.id.is_empty() || command.piped_id.is_empty() {
            return Err(KeelDatabaseError::InvalidArgument(
                "command id and piped id are required".into(),
            ));
        }
        let mut c = command.clone();
        let now = now_unix();
        if c.created_at == 0 {
            c.created_at = now;
        }
        c.updated_at = now;
        c.handled = false;
        c.handled_at = 0;
        c.status = CommandStatus::NotHandledYet;
        self.collection.create(&c.id, &c).await
    }

    /// Commands addressed to the piped that are not handled yet, oldest first.
    pub async fn list_unhandled(&self, piped_id: &str) -> KeelDatabaseResult<Vec<Command>> {
        let opts = ListOptions::new()
            .eq("piped_id", piped_id)
            .eq("handled", false)
            .order("created_at", Direction::Asc);
        self.collection.list(&opts).await
    }

    /// Marks a command handled, optionally persisting its output.
    ///
    /// A command is handled at most once; reporting the same outcome again is
    /// accepted without change.
    pub async fn update_handled(
        &self,
        id: &str,
        status: CommandStatus,
        metadata: &HashMap<String, String>,
        handled_at: i64,
        output: Option<&str>,
    ) -> KeelDatabaseResult<Command> {
        if !status.is_handled() {
            return Err(KeelDatabaseError::InvalidArgument(format!(
                "command {} cannot be reported with status {:?}",
                id, status
            )));
        }
        let output_key = match output {
            Some(out) => {
                let key = command_output_path(id);
                self.fs.put(&key, out.as_bytes()).await?;
                key
            }
            None => String::new(),
        };
        self.collection
            .update(id, |c| {
                if c.handled {
                    if c.status == status {
                        return Ok(false);
                    }
                    return Err(KeelDatabaseError::InvalidArgument(format!(
                        "command {} was already handled with status {:?}",
                        c.id, c.status
                    )));
                }
                c.handled = true;
                c.status = status;
                c.handled_at = if handled_at > 0 { handled_at } else { now_unix() };
                c.metadata
                    .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                if !output_key.is_empty() {
                    c.output_blob_key = output_key.clone();
                }
                c.updated_at = now_unix();
                Ok(true)
            })
            .await
    }

    pub async fn get_output(&self, id: &str) -> KeelDatabaseResult<String> {
        let data = self.fs.get(&command_output_path(id)).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use keel_common::model::CommandType;

    use super::*;
    use crate::repos::testing::stores;

    fn command(id: &str, piped: &str, created_at: i64) -> Command {
        Command {
            id: id.to_string(),
            piped_id: piped.to_string(),
            project_id: "proj".to_string(),
            application_id: String::new(),
            deployment_id: "d1".to_string(),
            stage_id: String::new(),
            r#type: CommandType::CancelDeployment,
            commander: "user".to_string(),
            handled: false,
            status: CommandStatus::NotHandledYet,
            metadata: HashMap::new(),
            output_blob_key: String::new(),
            handled_at: 0,
            sync_application: None,
            chain_sync_application: None,
            created_at,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn handled_commands_leave_the_unhandled_list() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.commands.create(&command("c2", "p1", 20)).await.unwrap();
        s.commands.create(&command("c1", "p1", 10)).await.unwrap();
        s.commands.create(&command("c3", "p2", 5)).await.unwrap();

        let ids: Vec<String> = s
            .commands
            .list_unhandled("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let c = s
            .commands
            .update_handled("c1", CommandStatus::Succeeded, &HashMap::new(), 100, Some("ok"))
            .await
            .unwrap();
        assert!(c.is_consistent());
        assert_eq!(c.output_blob_key, "command-output/c1.txt");
        assert_eq!(s.commands.get_output("c1").await.unwrap(), "ok");

        let remaining = s.commands.list_unhandled("p1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "c2");
    }

    #[tokio::test]
    async fn handled_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.commands.create(&command("c1", "p1", 10)).await.unwrap();
        s.commands
            .update_handled("c1", CommandStatus::Failed, &HashMap::new(), 100, None)
            .await
            .unwrap();
        let replay = s
            .commands
            .update_handled("c1", CommandStatus::Failed, &HashMap::new(), 200, None)
            .await
            .unwrap();
        assert_eq!(replay.handled_at, 100);

        let err = s
            .commands
            .update_handled("c1", CommandStatus::Succeeded, &HashMap::new(), 300, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelDatabaseError::InvalidArgument(_)));

        let err = s
            .commands
            .update_handled("c1", CommandStatus::NotHandledYet, &HashMap::new(), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelDatabaseError::InvalidArgument(_)));
        assert!(s
            .commands
            .update_handled("missing", CommandStatus::Failed, &HashMap::new(), 1, None)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
