use anyhow::anyhow;
use diesel::{result::Error as DieselError, QueryResult};

pub trait DieselErrorFixCause<T> {
    /// Keeps the cause chain of Diesel's wrapped errors (e.g. deserialization failures), which
    /// would otherwise be lost when converting to anyhow.
    fn fix_cause(self) -> anyhow::Result<T>;
}

impl<T> DieselErrorFixCause<T> for QueryResult<T> {
    fn fix_cause(self) -> anyhow::Result<T> {
        self.map_err(unwrap_diesel_err)
    }
}

fn unwrap_diesel_err(diesel_err: DieselError) -> anyhow::Error {
    match diesel_err {
        DieselError::DeserializationError(e) => anyhow!(e),
        DieselError::SerializationError(e) => anyhow!(e),
        DieselError::QueryBuilderError(e) => anyhow!(e),
        e => anyhow!(e),
    }
}
