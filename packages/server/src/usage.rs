//! Usage ledger.
//!
//! Append-only accounting of tokens and cost per job. Sums lag per-unit
//! progress by up to one flush interval, which is acceptable for budget
//! enforcement.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one usage record.
    pub async fn record(
        &self,
        owner_id: Uuid,
        job_id: Uuid,
        model: &str,
        totals: UsageTotals,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (id, owner_id, job_id, model, prompt_tokens, completion_tokens, cost_usd)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(job_id)
        .bind(model)
        .bind(totals.prompt_tokens)
        .bind(totals.completion_tokens)
        .bind(totals.cost_usd)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Spend for the current calendar month.
    pub async fn monthly_spend(&self, owner_id: Uuid) -> Result<f64> {
        let spend = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT COALESCE(SUM(cost_usd), 0)
            FROM usage_records
            WHERE owner_id = $1
              AND created_at >= date_trunc('month', NOW())
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(spend)
    }

    /// Total usage recorded for one job.
    pub async fn job_totals(&self, job_id: Uuid) -> Result<UsageTotals> {
        let row = sqlx::query_as::<_, (i64, i64, f64)>(
            r#"
            SELECT COALESCE(SUM(prompt_tokens), 0),
                   COALESCE(SUM(completion_tokens), 0),
                   COALESCE(SUM(cost_usd), 0)
            FROM usage_records
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageTotals {
            prompt_tokens: row.0,
            completion_tokens: row.1,
            cost_usd: row.2,
        })
    }
}
