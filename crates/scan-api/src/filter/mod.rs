//! OData-style filter strings.
//!
//! Watchers build filters with [`Filter`], which renders the textual form the
//! backend API accepts:
//!
//! ```text
//! status/state ne 'Done' and status/state ne 'Failed'
//! (terminatedOn eq null) and (assetInfo/objectType eq 'VMInfo')
//! ```
//!
//! The memory backend parses the same strings with [`parse`] and evaluates the
//! resulting [`FilterExpr`] against serialized entities.

mod builder;
mod evaluator;
mod parser;

pub use builder::{Filter, Literal};
pub use evaluator::{project, resolve_path};
pub use parser::{CompareOp, FilterExpr, parse};
