use std::num::NonZeroU32;

/// Internal identifier associated with a label.
///
/// [`NonZeroU32`] is used to enable some memory layout optimizations.
/// For example, `Option<LabelId>` is guaranteed to have the same size as
/// `LabelId`, which is 4 bytes:
/// ```
/// # use std::mem::size_of;
/// # use tessera_common::types::LabelId;
/// assert_eq!(size_of::<Option<LabelId>>(), size_of::<LabelId>());
/// assert_eq!(size_of::<Option<LabelId>>(), 4);
/// ```
pub type LabelId = NonZeroU32;

/// Internal identifier associated with an edge type.
pub type EdgeTypeId = NonZeroU32;

/// Internal identifier associated with a property (shard-wide unique).
pub type PropertyId = u32;

/// Globally unique edge identifier, assigned by the shard manager.
pub type Gid = u64;

/// Identifier of a command within one transaction. Commands are totally
/// ordered; observable effects follow that order.
pub type CommandId = u32;
