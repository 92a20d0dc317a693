use anyhow::Result;

use super::schema::Database;

impl Database {
    // ========================================================================
    // User Subscription Tree
    // ========================================================================

    /// The user's serialized subscription tree, if one was ever stored.
    pub async fn get_user_opml(&self, user_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT opml FROM user_data WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(opml,)| opml))
    }

    /// Read-modify-write of the user's tree inside one transaction.
    ///
    /// `update` receives the stored bytes and returns the replacement, or
    /// `None` to leave the row untouched. Returns whether a write happened.
    pub async fn update_user_opml<F>(&self, user_id: &str, update: F) -> Result<bool>
    where
        F: FnOnce(Option<&str>) -> Result<Option<String>>,
    {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT opml FROM user_data WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(next) = update(current.as_ref().map(|(opml,)| opml.as_str()))? else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            "INSERT INTO user_data (user_id, opml) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET opml = excluded.opml",
        )
        .bind(user_id)
        .bind(&next)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
