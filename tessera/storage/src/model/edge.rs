use serde::{Deserialize, Serialize};
use tessera_common::types::{EdgeTypeId, Gid};

use super::properties::PropertyStore;
use super::vertex::{PrimaryKey, VertexKey};

/// Reference to an incident edge, stored in a vertex's in/out edge lists.
/// `other` is the opposite endpoint, which may live on another shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeRef {
    pub other: VertexKey,
    pub edge_type: EdgeTypeId,
    pub gid: Gid,
}

impl EdgeRef {
    pub fn new(other: VertexKey, edge_type: EdgeTypeId, gid: Gid) -> Self {
        Self {
            other,
            edge_type,
            gid,
        }
    }
}

/// Container key of an edge: `(src, dst, type, gid)`. Edges sort by their
/// source key first, so every edge owned by one vertex is contiguous and a
/// shard split cuts the edge container with a single range bound.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub src: PrimaryKey,
    pub dst: VertexKey,
    pub edge_type: EdgeTypeId,
    pub gid: Gid,
}

/// An edge record: one version of the edge state. An edge is owned by the
/// shard holding its source vertex; `dst` may be remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub gid: Gid,
    pub src: VertexKey,
    pub dst: VertexKey,
    pub edge_type: EdgeTypeId,
    /// `None` when the shard is configured property-less for edges.
    pub properties: Option<PropertyStore>,
    pub is_tombstone: bool,
}

impl Edge {
    pub fn new(
        gid: Gid,
        src: VertexKey,
        dst: VertexKey,
        edge_type: EdgeTypeId,
        properties: Option<PropertyStore>,
    ) -> Self {
        Edge {
            gid,
            src,
            dst,
            edge_type,
            properties,
            is_tombstone: false,
        }
    }

    /// Placeholder occupying a container slot before the creating
    /// transaction fills it in.
    pub fn placeholder(key: &EdgeKey, src_label: tessera_common::types::LabelId) -> Self {
        Edge {
            gid: key.gid,
            src: VertexKey::new(src_label, key.src.clone()),
            dst: key.dst.clone(),
            edge_type: key.edge_type,
            properties: None,
            is_tombstone: true,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            src: self.src.pk.clone(),
            dst: self.dst.clone(),
            edge_type: self.edge_type,
            gid: self.gid,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.is_tombstone
    }

    /// The reference this edge contributes to its source's out-edge list.
    pub fn out_ref(&self) -> EdgeRef {
        EdgeRef::new(self.dst.clone(), self.edge_type, self.gid)
    }

    /// The reference this edge contributes to its destination's in-edge
    /// list.
    pub fn in_ref(&self) -> EdgeRef {
        EdgeRef::new(self.src.clone(), self.edge_type, self.gid)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use tessera_common::value::PropertyValue;

    use super::*;

    fn key(src: i64, dst: i64, edge_type: u32, gid: Gid) -> EdgeKey {
        let label = NonZeroU32::new(1).unwrap();
        EdgeKey {
            src: vec![PropertyValue::Int(src)],
            dst: VertexKey::new(label, vec![PropertyValue::Int(dst)]),
            edge_type: NonZeroU32::new(edge_type).unwrap(),
            gid,
        }
    }

    #[test]
    fn edge_keys_sort_by_source_first() {
        let mut keys = vec![key(2, 1, 1, 9), key(1, 5, 2, 3), key(1, 5, 1, 7)];
        keys.sort();
        assert_eq!(keys[0], key(1, 5, 1, 7));
        assert_eq!(keys[1], key(1, 5, 2, 3));
        assert_eq!(keys[2], key(2, 1, 1, 9));
    }

    #[test]
    fn reciprocal_refs_share_type_and_gid() {
        let label = NonZeroU32::new(1).unwrap();
        let edge = Edge::new(
            42,
            VertexKey::new(label, vec![PropertyValue::Int(1)]),
            VertexKey::new(label, vec![PropertyValue::Int(2)]),
            NonZeroU32::new(3).unwrap(),
            None,
        );
        assert_eq!(edge.out_ref().other, edge.dst);
        assert_eq!(edge.in_ref().other, edge.src);
        assert_eq!(edge.out_ref().gid, edge.in_ref().gid);
    }
}
