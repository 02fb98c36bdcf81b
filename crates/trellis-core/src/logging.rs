//! Logging targets and object tree visualization.
//!
//! Everything in this crate logs through `tracing`. Install a subscriber to
//! see the output, filtering by the targets in [`targets`]:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("trellis_core::signal=trace,trellis_core=info")
//!     .init();
//! ```
//!
//! [`ObjectTreeDebug`] renders the parent/child hierarchy of an
//! [`ObjectSystem`]:
//!
//! ```
//! use trellis_core::ObjectSystem;
//! use trellis_core::logging::{ObjectTreeDebug, TreeFormatOptions};
//!
//! let system = ObjectSystem::new();
//! let window = system.create_plain(None);
//! system.set_object_name(window, "window");
//! let button = system.create_plain(Some(window));
//! system.set_object_name(button, "ok");
//!
//! let text = ObjectTreeDebug::with_options(&system, TreeFormatOptions::minimal())
//!     .format_subtree(window)
//!     .unwrap();
//! assert_eq!(text, "window\n\u{2514}\u{2500}\u{2500} ok\n");
//! ```

use std::fmt::{self, Write as _};

use crate::error::{ObjectError, ObjectResult};
use crate::object::ObjectId;
use crate::system::ObjectSystem;

/// Target names for log filtering.
pub mod targets {
    /// Whole crate.
    pub const CORE: &str = "trellis_core";
    /// Object creation, destruction and reparenting.
    pub const OBJECT: &str = "trellis_core::object";
    /// Connections and emissions.
    pub const SIGNAL: &str = "trellis_core::signal";
    /// Event delivery and event loops.
    pub const EVENT: &str = "trellis_core::event";
    /// Thread affinity and loop threads.
    pub const THREAD: &str = "trellis_core::thread";
    /// Timers.
    pub const TIMER: &str = "trellis_core::timer";
}

/// Branch drawing style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// `|`, `+--` and `` `-- ``.
    Ascii,
    /// Box-drawing characters.
    #[default]
    Unicode,
    /// Indentation only.
    Compact,
}

impl TreeStyle {
    /// (continuation, tee, corner)
    fn glyphs(self) -> (&'static str, &'static str, &'static str) {
        match self {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => ("\u{2502}", "\u{251c}\u{2500}\u{2500}", "\u{2514}\u{2500}\u{2500}"),
            TreeStyle::Compact => ("", "-", "-"),
        }
    }
}

/// What [`ObjectTreeDebug`] prints per object.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    /// Branch drawing style.
    pub style: TreeStyle,
    /// Print object ids.
    pub show_ids: bool,
    /// Print class names.
    pub show_types: bool,
    /// Print the id of the thread each object lives in.
    pub show_threads: bool,
    /// Print dynamic properties and their values.
    pub show_properties: bool,
    /// Deepest level to print, the root being level 0.
    pub max_depth: Option<usize>,
    /// Extra spaces per level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: true,
            show_types: true,
            show_threads: false,
            show_properties: false,
            max_depth: None,
            indent_size: 3,
        }
    }
}

impl TreeFormatOptions {
    /// Everything on.
    pub fn detailed() -> Self {
        Self {
            show_threads: true,
            show_properties: true,
            ..Default::default()
        }
    }

    /// Names only.
    pub fn minimal() -> Self {
        Self {
            show_ids: false,
            show_types: false,
            ..Default::default()
        }
    }
}

/// Renders object trees of one [`ObjectSystem`] as text.
#[derive(Debug, Clone)]
pub struct ObjectTreeDebug<'a> {
    system: &'a ObjectSystem,
    options: TreeFormatOptions,
}

impl<'a> ObjectTreeDebug<'a> {
    /// Renderer with default options.
    pub fn new(system: &'a ObjectSystem) -> Self {
        Self::with_options(system, TreeFormatOptions::default())
    }

    /// Renderer with custom options.
    pub fn with_options(system: &'a ObjectSystem, options: TreeFormatOptions) -> Self {
        Self { system, options }
    }

    /// Render every root object and its descendants.
    pub fn format_all(&self) -> String {
        let roots = self.system.roots();
        let mut output = String::new();
        let _ = writeln!(output, "Object tree ({} objects):", self.system.object_count());
        if roots.is_empty() {
            output.push_str("  (empty)\n");
        }
        for root in roots {
            // A root destroyed concurrently is skipped.
            let _ = self.write_node(&mut output, root, &mut Vec::new(), None);
        }
        output
    }

    /// Render `root` and its descendants.
    pub fn format_subtree(&self, root: ObjectId) -> ObjectResult<String> {
        if !self.system.contains(root) {
            return Err(ObjectError::InvalidObjectId(root));
        }
        let mut output = String::new();
        self.write_node(&mut output, root, &mut Vec::new(), None)
            .map_err(|_| ObjectError::InvalidObjectId(root))?;
        Ok(output)
    }

    /// `open` holds, per ancestor level below the root, whether that ancestor
    /// has siblings still to come. `last` is `None` for the root itself.
    fn write_node(
        &self,
        out: &mut String,
        id: ObjectId,
        open: &mut Vec<bool>,
        last: Option<bool>,
    ) -> fmt::Result {
        let depth = open.len() + usize::from(last.is_some());
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return Ok(());
        }
        let Some(class) = self.system.class_name(id) else {
            return Err(fmt::Error);
        };

        let (pipe, tee, corner) = self.options.style.glyphs();
        let mut prefix = String::new();
        for &more in open.iter() {
            prefix.push_str(if more { pipe } else { "" });
            let used = if more { pipe.chars().count() } else { 0 };
            prefix.extend(std::iter::repeat_n(' ', (self.options.indent_size + 1).saturating_sub(used)));
        }

        out.push_str(&prefix);
        if let Some(is_last) = last {
            out.push_str(if is_last { corner } else { tee });
            out.push(' ');
        }
        match self.system.object_name(id).filter(|name| !name.is_empty()) {
            Some(name) => out.push_str(&name),
            None => out.push_str("(unnamed)"),
        }
        if self.options.show_ids {
            write!(out, " [{:?}]", id)?;
        }
        if self.options.show_types {
            write!(out, " ({class})")?;
        }
        if self.options.show_threads {
            if let Ok(thread) = self.system.thread(id) {
                write!(out, " @thread-{}", thread.id())?;
            }
        }
        out.push('\n');

        if let Some(is_last) = last {
            open.push(!is_last);
        }
        if self.options.show_properties {
            for name in self.system.dynamic_property_names(id) {
                let value = self.system.property(id, &name);
                let rail = if last == Some(false) { pipe } else { " " };
                writeln!(out, "{prefix}{rail}  .{name} = {value:?}")?;
            }
        }

        let children = self.system.children(id);
        let count = children.len();
        for (index, child) in children.into_iter().enumerate() {
            // Children destroyed while rendering are skipped.
            let _ = self.write_node(out, child, open, Some(index + 1 == count));
        }
        if last.is_some() {
            open.pop();
        }
        Ok(())
    }
}

impl fmt::Display for ObjectTreeDebug<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn named(system: &ObjectSystem, name: &str, parent: Option<ObjectId>) -> ObjectId {
        let id = system.create_plain(parent);
        system.set_object_name(id, name);
        id
    }

    #[test]
    fn empty_system() {
        let system = ObjectSystem::new();
        let output = ObjectTreeDebug::new(&system).format_all();
        assert!(output.contains("0 objects"));
        assert!(output.contains("(empty)"));
    }

    #[test]
    fn single_object_shows_id_and_type() {
        let system = ObjectSystem::new();
        let root = named(&system, "root", None);
        let output = ObjectTreeDebug::new(&system).format_subtree(root).unwrap();
        assert!(output.starts_with("root ["));
        assert!(output.contains("(Object)"));
    }

    #[test]
    fn hierarchy_uses_branches() {
        let system = ObjectSystem::new();
        let window = named(&system, "window", None);
        let panel = named(&system, "panel", Some(window));
        named(&system, "label", Some(panel));
        named(&system, "button", Some(window));

        let debug = ObjectTreeDebug::with_options(
            &system,
            TreeFormatOptions {
                style: TreeStyle::Ascii,
                ..TreeFormatOptions::minimal()
            },
        );
        let output = debug.format_subtree(window).unwrap();
        assert_eq!(output, "window\n+-- panel\n|   `-- label\n`-- button\n");
    }

    #[test]
    fn max_depth_cuts_descendants() {
        let system = ObjectSystem::new();
        let root = named(&system, "root", None);
        let child = named(&system, "child", Some(root));
        named(&system, "grandchild", Some(child));

        let options = TreeFormatOptions {
            max_depth: Some(1),
            ..TreeFormatOptions::minimal()
        };
        let output = ObjectTreeDebug::with_options(&system, options).format_subtree(root).unwrap();
        assert!(output.contains("child"));
        assert!(!output.contains("grandchild"));
    }

    #[test]
    fn detailed_lists_properties_and_threads() {
        let system = ObjectSystem::new();
        let root = named(&system, "root", None);
        system.set_property(root, "answer", Value::from(42_i64)).unwrap();
        let output = ObjectTreeDebug::with_options(&system, TreeFormatOptions::detailed())
            .format_subtree(root)
            .unwrap();
        assert!(output.contains(".answer"));
        assert!(output.contains("@thread-"));
    }

    #[test]
    fn unknown_root_is_an_error() {
        let system = ObjectSystem::new();
        let id = system.create_plain(None);
        system.destroy(id);
        assert_eq!(
            ObjectTreeDebug::new(&system).format_subtree(id),
            Err(ObjectError::InvalidObjectId(id))
        );
    }
}
