//! XML navigation helpers shared by the record parser, preflight and dumps.

mod utils;

pub use utils::{
    escape_attr, find_descendant_ns, get_text, is_oai, oai_child, oai_child_text, oai_children,
    oai_descendant, standalone_element,
};
