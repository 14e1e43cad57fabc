//! Topic templating and inbound topic parsing
//!
//! Every topic a node touches has the shape `<root><template>`, where the
//! template carries a `{nodeid}` placeholder:
//!
//! ```text
//! root = "home/"   template = "{nodeid}/CMD"   node = 5   →   "home/5/CMD"
//! ```

use thiserror::Error;

/// Placeholder replaced by the decimal node id
pub const NODE_ID_PLACEHOLDER: &str = "{nodeid}";

/// Size of the topic buffers the node firmware has always used
pub const DEFAULT_MAX_TOPIC_LEN: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic '{topic}' is {len} bytes long, limit is {max}")]
    TooLong {
        topic: String,
        len: usize,
        max: usize,
    },

    #[error("Template '{0}' has no {{nodeid}} placeholder")]
    MissingPlaceholder(String),
}

/// Concatenates `root` and `template` and substitutes every `{nodeid}`.
///
/// The result is rejected when it is longer than `max_len` bytes.
pub fn build_topic(
    root: &str,
    node_id: u8,
    template: &str,
    max_len: usize,
) -> Result<String, TopicError> {
    let topic = format!("{}{}", root, template).replace(NODE_ID_PLACEHOLDER, &node_id.to_string());

    if topic.len() > max_len {
        return Err(TopicError::TooLong {
            len: topic.len(),
            topic,
            max: max_len,
        });
    }

    Ok(topic)
}

/// Node id and trailing segment extracted from an inbound topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopic<'a> {
    pub node_id: u8,
    pub segment: &'a str,
}

/// Splits `.../<node_id>/<segment>` using the last two separators.
///
/// Returns `None` when there are fewer than two `/` or the node id segment is
/// not a decimal `u8`.
pub fn parse_node_topic(topic: &str) -> Option<NodeTopic<'_>> {
    let end = topic.rfind('/')?;
    let head = &topic[..end];
    let start = head.rfind('/')?;

    let node_id = head[start + 1..].parse().ok()?;

    Some(NodeTopic {
        node_id,
        segment: &topic[end + 1..],
    })
}

/// The full topic set of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopics {
    pub node_id: u8,
    pub root: String,
    pub command_template: String,
    pub status_template: String,
    pub debug_template: String,
    pub max_len: usize,
}

impl NodeTopics {
    pub fn command(&self) -> Result<String, TopicError> {
        self.build(&self.command_template)
    }

    pub fn status(&self) -> Result<String, TopicError> {
        self.build(&self.status_template)
    }

    pub fn debug(&self) -> Result<String, TopicError> {
        self.build(&self.debug_template)
    }

    pub fn build(&self, template: &str) -> Result<String, TopicError> {
        build_topic(&self.root, self.node_id, template, self.max_len)
    }

    /// Command template with the node id substituted but without the root
    pub fn command_subtopic(&self) -> String {
        self.command_template
            .replace(NODE_ID_PLACEHOLDER, &self.node_id.to_string())
    }

    /// Last path segment of the command template (`CMD` for `{nodeid}/CMD`)
    pub fn command_segment(&self) -> &str {
        self.command_template
            .rsplit('/')
            .next()
            .unwrap_or(&self.command_template)
    }

    /// Checks that every template carries the placeholder and fits the limit
    pub fn validate(&self) -> Result<(), TopicError> {
        for template in [
            &self.command_template,
            &self.status_template,
            &self.debug_template,
        ] {
            if !template.contains(NODE_ID_PLACEHOLDER) {
                return Err(TopicError::MissingPlaceholder(template.clone()));
            }
            // u8::MAX is the widest id, so this covers every node
            build_topic(&self.root, u8::MAX, template, self.max_len)?;
        }
        Ok(())
    }
}
