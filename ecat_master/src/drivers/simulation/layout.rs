//! Process-image layout of the simulated bus.

use ecat_common::bus::Direction;
use ecat_common::bus::config::SlaveConfig;
use ecat_common::bus::master::{MemoryRequirements, ProcessVariable};
use std::collections::{HashMap, HashSet};

/// Packed layout: variables in configuration order, byte aligned, inputs
/// and outputs in separate images.
#[derive(Debug, Clone, Default)]
pub struct SimLayout {
    variables: HashMap<(Direction, String), ProcessVariable>,
    hidden: HashSet<(Direction, String)>,
    loopback: Vec<Loopback>,
    requirements: MemoryRequirements,
}

/// Output copied onto the input of the same name, `[offset, offset+size)`
/// in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loopback {
    /// Byte offset in the output image.
    pub output: usize,
    /// Byte offset in the input image.
    pub input: usize,
    /// Length in bytes.
    pub size: usize,
}

impl SimLayout {
    /// Pack the variables of `slaves`.
    pub fn pack(slaves: &[SlaveConfig]) -> Self {
        let mut layout = Self::default();
        let mut cursor = MemoryRequirements::default();

        for slave in slaves {
            let mut inputs = HashMap::new();
            for var in &slave.inputs {
                let offset = cursor.input;
                layout.insert(Direction::Input, slave.qualified_name(&var.name), offset, var.kind.size());
                inputs.insert(var.name.as_str(), (offset, var.kind.size()));
                cursor.input += var.kind.size();
            }
            for var in &slave.outputs {
                let offset = cursor.output;
                layout.insert(Direction::Output, slave.qualified_name(&var.name), offset, var.kind.size());
                if let Some(&(input, size)) = inputs.get(var.name.as_str()) {
                    if size == var.kind.size() {
                        layout.loopback.push(Loopback {
                            output: offset,
                            input,
                            size,
                        });
                    }
                }
                cursor.output += var.kind.size();
            }
        }
        layout.requirements = cursor;
        layout
    }

    fn insert(&mut self, direction: Direction, name: String, offset: usize, size: usize) {
        self.variables.insert(
            (direction, name),
            ProcessVariable {
                bit_offset: (offset * 8) as u32,
                bit_size: (size * 8) as u32,
            },
        );
    }

    /// Live location of `name`, unless hidden.
    pub fn find(&self, direction: Direction, name: &str) -> Option<ProcessVariable> {
        let key = (direction, name.to_string());
        if self.hidden.contains(&key) {
            return None;
        }
        self.variables.get(&key).copied()
    }

    /// Pretend `name` is not part of the live layout.
    pub fn hide(&mut self, direction: Direction, name: &str) {
        self.hidden.insert((direction, name.to_string()));
    }

    /// Replace or add the live location of `name`.
    pub fn set(&mut self, direction: Direction, name: &str, variable: ProcessVariable) {
        let key = (direction, name.to_string());
        self.hidden.remove(&key);
        self.variables.insert(key, variable);
    }

    /// Output → input copies applied in OP.
    pub fn loopback(&self) -> &[Loopback] {
        &self.loopback
    }

    /// Image sizes in bytes.
    pub fn requirements(&self) -> MemoryRequirements {
        self.requirements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecat_common::bus::config::MasterConfig;
    use ecat_common::config::ConfigLoader;

    #[test]
    fn packs_in_configuration_order() {
        let config = MasterConfig::from_toml(
            r#"
[[slaves]]
id = 1
name = "A"
inputs = [{ name = "Word", kind = "u16" }, { name = "Echo", kind = "u32" }]
outputs = [{ name = "Echo", kind = "u32" }]

[[slaves]]
id = 2
name = "B"
inputs = [{ name = "Byte", kind = "u8" }]
"#,
        )
        .unwrap();
        let layout = SimLayout::pack(&config.slaves);

        assert_eq!(
            layout.requirements(),
            MemoryRequirements {
                input: 7,
                output: 4
            }
        );
        assert_eq!(
            layout.find(Direction::Input, "A.Echo"),
            Some(ProcessVariable {
                bit_offset: 16,
                bit_size: 32
            })
        );
        assert_eq!(layout.find(Direction::Input, "B.Byte").unwrap().bit_offset, 48);
        assert_eq!(
            layout.loopback(),
            &[Loopback {
                output: 0,
                input: 2,
                size: 4
            }]
        );
    }

    #[test]
    fn hide_and_override() {
        let config = MasterConfig::from_toml(
            "[[slaves]]\nid = 1\nname = \"A\"\ninputs = [{ name = \"X\", kind = \"u8\" }]\n",
        )
        .unwrap();
        let mut layout = SimLayout::pack(&config.slaves);
        layout.hide(Direction::Input, "A.X");
        assert!(layout.find(Direction::Input, "A.X").is_none());

        let moved = ProcessVariable {
            bit_offset: 3,
            bit_size: 8,
        };
        layout.set(Direction::Input, "A.X", moved);
        assert_eq!(layout.find(Direction::Input, "A.X"), Some(moved));
    }
}
