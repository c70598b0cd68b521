use futures::future::BoxFuture;

use crate::errors::DbError;
use crate::frame::frame_errors::ParseError;
use crate::frame::PacketReader;

/// Nested exceptions deeper than this are cut off.
const MAX_NESTING: usize = 32;

/// Decodes an `Exception` packet body, including its chain of nested exceptions.
pub async fn deserialize(r: &mut PacketReader) -> Result<DbError, ParseError> {
    read_exception(r, 0).await
}

fn read_exception(r: &mut PacketReader, depth: usize) -> BoxFuture<'_, Result<DbError, ParseError>> {
    Box::pin(async move {
        let code = r.read_i32().await?;
        let name = r.read_string().await?;
        let raw_message = r.read_string().await?;
        let message = raw_message
            .strip_prefix(&format!("{name}:"))
            .unwrap_or(&raw_message)
            .trim()
            .to_owned();
        let stack_trace = r.read_string().await?;
        let has_nested = r.read_bool().await?;
        let nested = if has_nested {
            if depth >= MAX_NESTING {
                return Err(ParseError::BadData("exception nesting too deep".to_owned()));
            }
            Some(Box::new(read_exception(r, depth + 1).await?))
        } else {
            None
        };
        Ok(DbError {
            code,
            name,
            message,
            stack_trace,
            nested,
        })
    })
}
