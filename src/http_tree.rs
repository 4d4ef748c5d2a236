use std::collections::{BTreeSet, HashMap};

use regex::Regex;

/// Digit wildcard, intermediate and leaf forms (§1 GLOSSARY, §12).
pub const WILD_PATH_DIGIT: &str = "/[0-9]+";
pub const WILD_PATH_DIGIT_LEAF: &str = "/[0-9^/]+";
/// Char wildcard, intermediate and leaf forms.
pub const WILD_PATH_CHAR: &str = "/.+";
pub const WILD_PATH_CHAR_LEAF: &str = "/.[^/]+";

fn wild_paths() -> [&'static str; 2] {
    [WILD_PATH_DIGIT, WILD_PATH_CHAR]
}

/// One segment-tree node (§4.3 C3 HTTP Path Aggregator). A forest of these,
/// keyed by root-segment string, represents all paths observed for one
/// `(peer-group, method)` bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    path: String,
    depth: usize,
    touch_count: u64,
    children: Vec<Node>,
}

impl Node {
    fn leaf(path: String, depth: usize) -> Self {
        Self { path, depth, touch_count: 1, children: Vec::new() }
    }

    fn children_touch_count(&self) -> u64 {
        self.children.iter().map(|c| c.touch_count).sum()
    }

    /// Insert the remaining path segments under this node, creating a new
    /// child only for the first unmatched segment (mirrors the Go
    /// `Node.insert` — `break` after the first segment each call).
    fn insert(&mut self, segments: &[String]) {
        let Some(first) = segments.first() else { return };
        let depth = self.depth + 1;
        match self.find_child_index(first, depth) {
            Some(i) => {
                self.children[i].touch_count += 1;
                self.children[i].insert(&segments[1..]);
            }
            None => {
                let mut child = Node::leaf(first.clone(), depth);
                child.insert(&segments[1..]);
                self.children.push(child);
            }
        }
    }

    fn find_child_index(&self, segment: &str, depth: usize) -> Option<usize> {
        self.children.iter().position(|child| {
            if child.depth != depth {
                return false;
            }
            if wild_paths().contains(&child.path.as_str()) {
                match Regex::new(&child.path) {
                    Ok(re) => re.find(segment).map(|m| m.as_str() == segment).unwrap_or(false),
                    Err(_) => false,
                }
            } else {
                child.path == segment
            }
        })
    }

    /// Depth-first collapse: once a node's direct children exceed
    /// `threshold`, replace them with a single wildcard child whose
    /// grandchildren are the union of the collapsed children's children.
    fn aggregate_child_nodes(&mut self, threshold: usize) {
        for child in &mut self.children {
            child.aggregate_child_nodes(threshold);
        }

        if self.children.len() > threshold {
            let child_segments: Vec<String> = self.children.iter().map(|c| c.path.clone()).collect();
            let wild_path = if check_digits_only(&child_segments) {
                WILD_PATH_DIGIT
            } else {
                WILD_PATH_CHAR
            };

            let mut merged = Node {
                depth: self.depth + 1,
                path: wild_path.to_string(),
                touch_count: 0,
                children: Vec::new(),
            };
            for child in self.children.drain(..) {
                merged.touch_count += child.touch_count;
                merged.children.extend(child.children);
            }
            merged.merge_same_child_nodes();
            self.children = vec![merged];
        }
    }

    /// Collapse sibling children with identical `(path, depth)`, summing
    /// touch counts and unioning grandchildren.
    fn merge_same_child_nodes(&mut self) {
        if self.children.is_empty() {
            return;
        }

        let mut order: Vec<(String, usize)> = Vec::new();
        let mut touch_counts: HashMap<(String, usize), u64> = HashMap::new();
        let mut grandchildren: HashMap<(String, usize), Vec<Node>> = HashMap::new();
        let mut any_merged = false;

        for child in self.children.drain(..) {
            let key = (child.path.clone(), child.depth);
            if let Some(existing) = grandchildren.get_mut(&key) {
                existing.extend(child.children);
                any_merged = true;
            } else {
                grandchildren.insert(key.clone(), child.children);
                order.push(key.clone());
            }
            *touch_counts.entry(key).or_insert(0) += child.touch_count;
        }

        if !any_merged {
            // restore in original relative order, nothing to merge
            for key in order {
                let children = grandchildren.remove(&key).unwrap_or_default();
                let touch_count = touch_counts.remove(&key).unwrap_or(1);
                self.children.push(Node { path: key.0, depth: key.1, touch_count, children });
            }
            return;
        }

        for key in order {
            let children = grandchildren.remove(&key).unwrap_or_default();
            let touch_count = touch_counts.remove(&key).unwrap_or(1);
            self.children.push(Node { path: key.0, depth: key.1, touch_count, children });
        }
    }

    fn generate_paths(&self, results: &mut BTreeSet<String>, parent_path: &str) {
        let this_path = format!("{parent_path}{}", self.path);
        for child in &self.children {
            child.generate_paths(results, &this_path);
        }

        let children_touch = self.children_touch_count();
        if self.children.is_empty() {
            if self.path == WILD_PATH_DIGIT {
                results.insert(format!("{parent_path}{WILD_PATH_DIGIT_LEAF}"));
            } else if self.path == WILD_PATH_CHAR {
                results.insert(format!("{parent_path}{WILD_PATH_CHAR_LEAF}"));
            } else {
                results.insert(this_path);
            }
        } else if self.touch_count > children_touch {
            results.insert(this_path);
        }
    }
}

fn check_digits_only(segments: &[String]) -> bool {
    segments.iter().all(|s| {
        s.splitn(2, '/').nth(1).map(|rest| rest.parse::<i64>().is_ok()).unwrap_or(false)
    })
}

static SEGMENT_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn segment_regex() -> &'static Regex {
    SEGMENT_RE.get_or_init(|| Regex::new(r"(/.[^/]*)").expect("valid segment regex"))
}

fn tokenize(path: &str) -> Vec<String> {
    segment_regex().find_iter(path).map(|m| m.as_str().to_string()).collect()
}

/// Build the forest for one bucket of paths, updating any existing roots
/// in `tree` in place (§4.3).
pub fn build_path_tree(tree: &mut HashMap<String, Node>, paths: &[String]) {
    let mut sorted = paths.to_vec();
    sorted.sort();

    for path in &sorted {
        if path == "/" {
            continue;
        }
        let tokens = tokenize(path);
        let Some(root_segment) = tokens.first() else { continue };
        match tree.get_mut(root_segment) {
            Some(root) => {
                root.touch_count += 1;
                root.insert(&tokens[1..]);
            }
            None => {
                let mut root = Node::leaf(root_segment.clone(), 0);
                root.insert(&tokens[1..]);
                tree.insert(root_segment.clone(), root);
            }
        }
    }
}

/// Build, aggregate and emit the final wildcard-collapsed path set for one
/// `(peer-group, method)` bucket (§4.3). `tree` is kept across ticks by the
/// caller so repeated aggregation stays stable as new paths arrive.
pub fn aggregate_paths(tree: &mut HashMap<String, Node>, paths: &[String], threshold: usize) -> Vec<String> {
    build_path_tree(tree, paths);

    for root in tree.values_mut() {
        root.aggregate_child_nodes(threshold);
    }

    let mut results = BTreeSet::new();
    for root in tree.values() {
        root.generate_paths(&mut results, "");
    }

    let mut out: Vec<String> = results.into_iter().collect();
    if paths.iter().any(|p| p == "/") {
        out.push("/".to_string());
    }
    out
}
