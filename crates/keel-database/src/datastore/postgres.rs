use async_trait::async_trait;
use keel_common::time::now_unix;
use serde_json::{Map, Value};
use sqlx::{types::Json, Postgres, QueryBuilder};

use super::{DataStore, Direction, Document, Filter, Kind, ListOptions, Operator};
use crate::{
    error::{KeelDatabaseError, KeelDatabaseResult},
    AppDatabase,
};

const COLUMNS: &str = "id, version, data, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    version: i64,
    data: Json<Value>,
    created_at: i64,
    updated_at: i64,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            version: row.version,
            data: row.data.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Documents stored in the `keel_documents` table, one row per `(kind, id)`.
#[derive(Debug, Clone)]
pub struct PostgresDataStore {
    db: AppDatabase,
}

impl PostgresDataStore {
    pub fn new(db: AppDatabase) -> Self {
        Self { db }
    }
}

fn project_of(data: &Value) -> String {
    data.get("project_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Builds `{"a": {"b": value}}` for the path `a.b` so that equality can use
/// jsonb containment and hit the GIN index.
fn containment(path: &[&str], value: &Value) -> Value {
    path.iter().rev().fold(value.clone(), |acc, key| {
        let mut m = Map::new();
        m.insert(key.to_string(), acc);
        Value::Object(m)
    })
}

fn text_path(path: &[&str]) -> String {
    format!("'{{{}}}'", path.join(","))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> KeelDatabaseResult {
    let path = filter.path()?;
    let column = format!("(data #>> {})", text_path(&path));
    let cmp = match filter.operator {
        Operator::Eq => {
            qb.push(" AND data @> ");
            qb.push_bind(Json(containment(&path, &filter.value)));
            return Ok(());
        }
        Operator::NotEq => {
            qb.push(" AND NOT (data @> ");
            qb.push_bind(Json(containment(&path, &filter.value)));
            qb.push(")");
            return Ok(());
        }
        Operator::In => {
            let items: Vec<String> = filter
                .value
                .as_array()
                .map(|items| items.iter().map(as_text).collect())
                .unwrap_or_default();
            qb.push(format!(" AND {} = ANY(", column));
            qb.push_bind(items);
            qb.push(")");
            return Ok(());
        }
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
    };
    match &filter.value {
        Value::Number(n) => {
            qb.push(format!(" AND ({})::double precision {} ", column, cmp));
            qb.push_bind(n.as_f64().unwrap_or_default());
        }
        other => {
            qb.push(format!(" AND {} {} ", column, cmp));
            qb.push_bind(as_text(other));
        }
    }
    Ok(())
}

#[async_trait]
impl DataStore for PostgresDataStore {
    async fn get(&self, kind: Kind, id: &str) -> KeelDatabaseResult<Document> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {} FROM keel_documents WHERE kind = $1 AND id = $2",
            COLUMNS
        ))
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(self.db.get_pool())
        .await?;
        row.map(Document::from).ok_or_else(|| {
            KeelDatabaseError::NotFound(format!("{} {} was not found", kind, id))
        })
    }

    async fn create(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document> {
        let now = now_unix();
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"INSERT INTO keel_documents
            (kind, id, project_id, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $5)
            ON CONFLICT (kind, id) DO NOTHING
            RETURNING {}"#,
            COLUMNS
        ))
        .bind(kind.as_str())
        .bind(id)
        .bind(project_of(&data))
        .bind(Json(&data))
        .bind(now)
        .fetch_optional(self.db.get_pool())
        .await?;
        row.map(Document::from).ok_or_else(|| {
            KeelDatabaseError::AlreadyExists(format!("{} {} already exists", kind, id))
        })
    }

    async fn put(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document> {
        let now = now_unix();
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"INSERT INTO keel_documents
            (kind, id, project_id, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $5)
            ON CONFLICT (kind, id) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                data = EXCLUDED.data,
                version = keel_documents.version + 1,
                updated_at = EXCLUDED.updated_at
            RETURNING {}"#,
            COLUMNS
        ))
        .bind(kind.as_str())
        .bind(id)
        .bind(project_of(&data))
        .bind(Json(&data))
        .bind(now)
        .fetch_one(self.db.get_pool())
        .await?;
        Ok(row.into())
    }

    async fn update(
        &self,
        kind: Kind,
        id: &str,
        version: i64,
        data: Value,
    ) -> KeelDatabaseResult<Document> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"UPDATE keel_documents
            SET data = $1, project_id = $2, version = version + 1, updated_at = $3
            WHERE kind = $4 AND id = $5 AND version = $6
            RETURNING {}"#,
            COLUMNS
        ))
        .bind(Json(&data))
        .bind(project_of(&data))
        .bind(now_unix())
        .bind(kind.as_str())
        .bind(id)
        .bind(version)
        .fetch_optional(self.db.get_pool())
        .await?;
        match row {
            Some(row) => Ok(row.into()),
            None => {
                // Distinguish a missing row from a lost race.
                self.get(kind, id).await?;
                Err(KeelDatabaseError::VersionConflict(format!("{} {}", kind, id)))
            }
        }
    }

    async fn list(&self, kind: Kind, opts: &ListOptions) -> KeelDatabaseResult<Vec<Document>> {
        opts.validate()?;
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM keel_documents WHERE kind = ",
            COLUMNS
        ));
        qb.push_bind(kind.as_str());
        for filter in &opts.filters {
            push_filter(&mut qb, filter)?;
        }
        qb.push(" ORDER BY ");
        for order in &opts.orders {
            let path: Vec<&str> = order.field.split('.').collect();
            let direction = match order.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            qb.push(format!("data #> {} {}, ", text_path(&path), direction));
        }
        qb.push("id ASC");
        if opts.limit > 0 {
            qb.push(" LIMIT ");
            qb.push_bind(opts.limit as i64);
        }
        let rows = qb
            .build_query_as::<DocumentRow>()
            .fetch_all(self.db.get_pool())
            .await?;
        Ok(rows.into_iter().map(Document::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn containment_nests_path() {
        assert_eq!(
            containment(&["sync_state", "status"], &json!("SYNCED")),
            json!({"sync_state": {"status": "SYNCED"}})
        );
        assert_eq!(containment(&["piped_id"], &json!("p")), json!({"piped_id": "p"}));
    }

    #[test]
    fn builds_list_query() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM keel_documents WHERE kind = ");
        qb.push_bind("event");
        push_filter(&mut qb, &Filter::eq("name", "image")).unwrap();
        push_filter(&mut qb, &Filter::new("created_at", Operator::Gte, 10)).unwrap();
        push_filter(&mut qb, &Filter::new("status", Operator::In, json!(["A", "B"]))).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT id FROM keel_documents WHERE kind = $1 AND data @> $2 \
             AND ((data #>> '{created_at}'))::double precision >= $3 \
             AND (data #>> '{status}') = ANY($4)"
        );
    }
}
