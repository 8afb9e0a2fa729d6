use crate::{Connection, DatabaseError};

/// One connection checkout for the duration of a call.
///
/// In auto-commit mode every statement commits on its own. In explicit mode
/// a transaction is opened on creation and rolled back on drop unless
/// [`commit`](Self::commit) ran. Either way the connection is released when
/// the scope is dropped.
pub struct Transaction<'a> {
    connection: Box<dyn Connection + 'a>,
    auto_commit: bool,
    finished: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("auto_commit", &self.auto_commit)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> Transaction<'a> {
    /// # Errors
    ///
    /// * If an explicit transaction fails to start
    pub fn new(
        mut connection: Box<dyn Connection + 'a>,
        auto_commit: bool,
    ) -> Result<Self, DatabaseError> {
        if !auto_commit {
            connection.begin()?;
        }
        Ok(Self {
            connection,
            auto_commit,
            finished: false,
        })
    }

    #[must_use]
    pub const fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        &mut *self.connection
    }

    /// Commits an explicit transaction. A no-op in auto-commit mode.
    ///
    /// # Errors
    ///
    /// * If the commit fails, in which case the transaction is rolled back
    ///   when the scope drops
    pub fn commit(mut self) -> Result<(), DatabaseError> {
        if !self.auto_commit {
            self.connection.commit()?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.auto_commit || self.finished {
            return;
        }
        log::debug!("Rolling back uncommitted transaction");
        if let Err(e) = self.connection.rollback() {
            log::error!("Failed to roll back transaction: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{Event, ScriptedSource};
    use crate::ConnectionSource as _;

    #[test_log::test]
    fn explicit_scope_commits() {
        let source = ScriptedSource::default();

        let transaction = Transaction::new(source.connection().unwrap(), false).unwrap();
        transaction.commit().unwrap();

        assert_eq!(
            source.events(),
            vec![Event::Checkout, Event::Begin, Event::Commit, Event::Release]
        );
    }

    #[test_log::test]
    fn explicit_scope_rolls_back_when_dropped() {
        let source = ScriptedSource::default();

        {
            let mut transaction = Transaction::new(source.connection().unwrap(), false).unwrap();
            transaction.connection().execute("delete from t", &[]).unwrap();
        }

        assert_eq!(
            source.events(),
            vec![
                Event::Checkout,
                Event::Begin,
                Event::Execute("delete from t".into()),
                Event::Rollback,
                Event::Release,
            ]
        );
    }

    #[test_log::test]
    fn auto_commit_scope_never_opens_a_transaction() {
        let source = ScriptedSource::default();

        {
            let mut transaction = Transaction::new(source.connection().unwrap(), true).unwrap();
            transaction.connection().execute("delete from t", &[]).unwrap();
        }

        assert_eq!(
            source.events(),
            vec![
                Event::Checkout,
                Event::Execute("delete from t".into()),
                Event::Release,
            ]
        );
    }
}
