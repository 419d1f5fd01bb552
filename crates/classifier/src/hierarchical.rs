use crate::error::Result;
use crate::kmeans::{coherence, KMeansConfig, SphericalKMeans};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    pub kmeans: KMeansConfig,
    /// Levels below the root cluster.
    pub max_depth: usize,
    /// Clusters at or below this size are not split further.
    pub min_cluster_size: usize,
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            kmeans: KMeansConfig {
                k: 4,
                ..KMeansConfig::default()
            },
            max_depth: 3,
            min_cluster_size: 4,
        }
    }
}

/// Staging tree of clusters, independent of the taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Indices into the input slice.
    pub members: Vec<usize>,
    pub centroid: Vec<f32>,
    pub coherence: f32,
    pub depth: usize,
    pub children: Vec<ClusterNode>,
}

impl ClusterNode {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn leaves(&self) -> Vec<&ClusterNode> {
        if self.is_leaf() {
            return vec![self];
        }
        self.children.iter().flat_map(ClusterNode::leaves).collect()
    }

    #[must_use]
    pub fn max_depth(&self) -> usize {
        self.children
            .iter()
            .map(ClusterNode::max_depth)
            .max()
            .unwrap_or(self.depth)
    }

    /// Flattens leaves into `(path segments, members)` using `name` for each
    /// non-root node. The root contributes no segment.
    pub fn flatten<F>(&self, name: &mut F) -> Vec<(Vec<String>, Vec<usize>)>
    where
        F: FnMut(&ClusterNode) -> String,
    {
        let mut out = Vec::new();
        for child in &self.children {
            child.flatten_into(Vec::new(), name, &mut out);
        }
        if self.children.is_empty() && !self.members.is_empty() {
            out.push((Vec::new(), self.members.clone()));
        }
        out
    }

    fn flatten_into<F>(
        &self,
        mut prefix: Vec<String>,
        name: &mut F,
        out: &mut Vec<(Vec<String>, Vec<usize>)>,
    ) where
        F: FnMut(&ClusterNode) -> String,
    {
        prefix.push(name(self));
        if self.is_leaf() {
            out.push((prefix, self.members.clone()));
            return;
        }
        for child in &self.children {
            child.flatten_into(prefix.clone(), name, out);
        }
    }
}

/// Recursively re-clusters each cluster until depth or size limits stop it.
pub fn cluster_hierarchy(
    vectors: &[Vec<f32>],
    config: &HierarchicalConfig,
    deadline: Option<Instant>,
) -> Result<ClusterNode> {
    config.kmeans.validate()?;
    let members: Vec<usize> = (0..vectors.len()).collect();
    let root = build_node(vectors, members, 0, config, deadline)?;
    log::debug!(
        "hierarchical clustering: {} points, depth {}, {} leaves",
        vectors.len(),
        root.max_depth(),
        root.leaves().len()
    );
    Ok(root)
}

fn build_node(
    vectors: &[Vec<f32>],
    members: Vec<usize>,
    depth: usize,
    config: &HierarchicalConfig,
    deadline: Option<Instant>,
) -> Result<ClusterNode> {
    let member_vectors: Vec<&[f32]> = members.iter().map(|i| vectors[*i].as_slice()).collect();
    let centroid = centroid_of(&member_vectors);
    let mut node = ClusterNode {
        coherence: coherence(&member_vectors),
        centroid,
        members,
        depth,
        children: Vec::new(),
    };

    let out_of_time = deadline.is_some_and(|d| Instant::now() >= d);
    if depth >= config.max_depth || node.members.len() <= config.min_cluster_size || out_of_time {
        return Ok(node);
    }

    let k = config.kmeans.k.min(node.members.len() / config.min_cluster_size.max(1)).max(2);
    let kmeans = SphericalKMeans::new(KMeansConfig {
        k,
        seed: config.kmeans.seed.wrapping_add(depth as u64),
        ..config.kmeans.clone()
    })?;
    let subset: Vec<Vec<f32>> = node.members.iter().map(|i| vectors[*i].clone()).collect();
    let result = kmeans.fit_until(&subset, deadline)?;
    let groups: Vec<Vec<usize>> = result
        .members()
        .into_iter()
        .filter(|group| !group.is_empty())
        .map(|group| group.into_iter().map(|local| node.members[local]).collect())
        .collect();

    // A split that leaves everything together adds a level without information.
    if groups.len() < 2 {
        return Ok(node);
    }
    for group in groups {
        node.children
            .push(build_node(vectors, group, depth + 1, config, deadline)?);
    }
    Ok(node)
}

fn centroid_of(vectors: &[&[f32]]) -> Vec<f32> {
    let dim = vectors.first().map_or(0, |v| v.len());
    let mut sum = vec![0.0f32; dim];
    for vector in vectors {
        for (slot, value) in sum.iter_mut().zip(vector.iter()) {
            *slot += value;
        }
    }
    sift_vector_store::normalized(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn grid() -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        for axis in 0..4 {
            for j in 0..6 {
                let mut v = vec![0.02; 4];
                v[axis] = 1.0;
                v[(axis + 1) % 4] += j as f32 * 0.01;
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn respects_depth_and_size_limits() {
        let config = HierarchicalConfig {
            kmeans: KMeansConfig {
                k: 4,
                ..KMeansConfig::default()
            },
            max_depth: 2,
            min_cluster_size: 3,
        };
        let root = cluster_hierarchy(&grid(), &config, None).unwrap();
        assert!(root.max_depth() <= 2);
        let total: usize = root.leaves().iter().map(|leaf| leaf.members.len()).sum();
        assert_eq!(total, 24);
        assert!(root.children.len() >= 2);
    }

    #[test]
    fn small_input_is_a_single_leaf() {
        let config = HierarchicalConfig::default();
        let root = cluster_hierarchy(&[vec![1.0, 0.0], vec![0.0, 1.0]], &config, None).unwrap();
        assert!(root.is_leaf());
        let flat = root.flatten(&mut |_| "x".to_string());
        assert_eq!(flat, vec![(Vec::<String>::new(), vec![0, 1])]);
    }

    #[test]
    fn flatten_names_every_level() {
        let config = HierarchicalConfig {
            max_depth: 1,
            min_cluster_size: 2,
            ..HierarchicalConfig::default()
        };
        let root = cluster_hierarchy(&grid(), &config, None).unwrap();
        let mut counter = 0;
        let flat = root.flatten(&mut |node| {
            counter += 1;
            format!("c{}-{}", node.depth, counter)
        });
        assert_eq!(flat.len(), root.children.len());
        assert!(flat.iter().all(|(path, _)| path.len() == 1));
    }

    #[test]
    fn empty_input_is_an_empty_root() {
        let root = cluster_hierarchy(&[], &HierarchicalConfig::default(), None).unwrap();
        assert!(root.members.is_empty());
        assert!(root.flatten(&mut |_| String::new()).is_empty());
    }
}
