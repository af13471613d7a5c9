use crate::nodes::Node;
use itertools::Itertools;
use rand::{seq::SliceRandom, Rng};
use std::{collections::BTreeSet, fmt};
use tracing::{debug, instrument, warn};

/// two distinct nodes that benchmark against each other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    first: Node,
    second: Node,
}

impl Pair {
    /// returns `None` for a self-pair
    pub fn new(first: Node, second: Node) -> Option<Self> {
        (first != second).then_some(Self { first, second })
    }

    pub fn first(&self) -> &Node {
        &self.first
    }

    pub fn second(&self) -> &Node {
        &self.second
    }
}

/// renders in the `a,b` form the scheduler expects for a node list
impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.second)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PairingResult {
    pub pairs: Vec<Pair>,
    /// set when the input had an odd number of distinct nodes
    pub excluded: Option<Node>,
}

/// Randomly partition `nodes` into disjoint pairs.
///
/// Repeated identifiers are collapsed first, so every node ends up in at most one pair.
/// With an odd count one node is picked uniformly at random and left out.
/// The remaining nodes are shuffled once and cut into consecutive pairs,
/// which gives a uniformly random perfect matching.
#[instrument(level = "debug", skip_all, fields(nodes = nodes.len()))]
pub fn pair_nodes<R: Rng>(nodes: Vec<Node>, rng: &mut R) -> PairingResult {
    let mut nodes = drop_duplicates(nodes);
    nodes.shuffle(rng);

    let excluded = if nodes.len() % 2 != 0 {
        let node = nodes.remove(rng.gen_range(0..nodes.len()));
        warn!(node = %node, "Odd number of nodes detected, excluding node from pairing");

        Some(node)
    } else {
        None
    };

    let pairs = nodes
        .into_iter()
        .tuples()
        // duplicates are gone, so every tuple is a valid pair
        .filter_map(|(first, second)| Pair::new(first, second))
        .collect_vec();

    debug!(pairs = pairs.len(), "Finished pairing");

    PairingResult { pairs, excluded }
}

/// keep the first occurrence of every node
fn drop_duplicates(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = BTreeSet::new();

    nodes
        .into_iter()
        .filter(|node| {
            let fresh = seen.insert(node.clone());

            if !fresh {
                warn!(node = %node, "Node listed more than once, ignoring repeated entry");
            }

            fresh
        })
        .collect()
}
