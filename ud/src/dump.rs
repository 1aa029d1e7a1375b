//! Graph exports: Graphviz, HTML and CSV renditions of a built graph.

use std::io::Write;
use std::path::Path;

use crate::graph::Ud;
use crate::{Error, PathTemplate, Word};

#[derive(Debug, Copy, Clone)]
enum Space {
    Reg,
    Mem,
}

impl Space {
    fn prefix(self) -> &'static str {
        match self {
            Self::Reg => "r",
            Self::Mem => "m",
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '"' => escaped.push_str("&quot;"),
            '&' => escaped.push_str("&amp;"),
            '\'' => escaped.push_str("&#39;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl<W: Word> Ud<W> {
    fn resolve(&self, space: Space, use_index: u32) -> (u64, u64, u32) {
        let (def, trace_index) = match space {
            Space::Reg => self
                .reg()
                .resolve_use(use_index, self.trace_table(), |entry| entry.reg_def_start),
            Space::Mem => self
                .mem()
                .resolve_use(use_index, self.trace_table(), |entry| entry.mem_def_start),
        };
        (def.start.to_u64(), def.end.to_u64(), trace_index)
    }

    fn def_range(&self, space: Space, def_index: u32) -> (u64, u64) {
        let def = match space {
            Space::Reg => self.reg().defs()[def_index as usize],
            Space::Mem => self.mem().defs()[def_index as usize],
        };
        (def.start.to_u64(), def.end.to_u64())
    }

    /// Writes the graph as a Graphviz digraph: one node per dynamic
    /// instruction, one labeled edge per use pointing at its producer.
    pub fn dump_dot<Out: Write>(&mut self, out: &mut Out) -> Result<(), Error> {
        writeln!(out, "digraph ud {{")?;
        for trace_index in 0..self.trace_len() as u32 {
            let entry = self.trace_table()[trace_index as usize];
            let pc = self.pc_for_code(entry.code_index);
            let disasm = self.disasm_text(entry.code_index);
            writeln!(
                out,
                "    {} [label=\"[{}] 0x{:x}: {}\"]",
                trace_index, trace_index, pc, disasm
            )?;
            for (space, uses) in [
                (Space::Reg, entry.reg_use_start..entry.reg_use_end),
                (Space::Mem, entry.mem_use_start..entry.mem_use_end),
            ] {
                for use_index in uses {
                    let (start, end, producer) = self.resolve(space, use_index);
                    writeln!(
                        out,
                        "    {} -> {} [label=\"{}0x{:x}-0x{:x}\"]",
                        trace_index,
                        producer,
                        space.prefix(),
                        start,
                        end
                    )?;
                }
            }
        }
        writeln!(out, "}}")?;
        Ok(())
    }

    /// Writes the graph as an HTML table, one row per dynamic instruction
    /// with its uses linking back to the producing rows.
    pub fn dump_html<Out: Write>(&mut self, out: &mut Out) -> Result<(), Error> {
        out.write_all(
            concat!(
                "<!DOCTYPE html>\n",
                "<html>\n",
                "<head>\n",
                "<title>ud</title>\n",
                "</head>\n",
                "<body>\n",
                "<table>\n",
                "    <tr>\n",
                "        <th>Seq</th>\n",
                "        <th>Address</th>\n",
                "        <th>Bytes</th>\n",
                "        <th>Instruction</th>\n",
                "        <th>Uses</th>\n",
                "        <th>Defs</th>\n",
                "    </tr>\n",
            )
            .as_bytes(),
        )?;
        for trace_index in 0..self.trace_len() as u32 {
            let entry = self.trace_table()[trace_index as usize];
            let pc = self.pc_for_code(entry.code_index);
            let bytes = hex_bytes(self.text_for_code(entry.code_index));
            let disasm = html_escape(&self.disasm_text(entry.code_index));
            writeln!(out, "    <tr id=\"{}\">", trace_index)?;
            writeln!(out, "        <td>{}</td>", trace_index)?;
            writeln!(out, "        <td>0x{:x}</td>", pc)?;
            writeln!(out, "        <td>{}</td>", bytes)?;
            writeln!(out, "        <td>{}</td>", disasm)?;
            writeln!(out, "        <td>")?;
            for (space, uses) in [
                (Space::Reg, entry.reg_use_start..entry.reg_use_end),
                (Space::Mem, entry.mem_use_start..entry.mem_use_end),
            ] {
                for use_index in uses {
                    let (start, end, producer) = self.resolve(space, use_index);
                    writeln!(
                        out,
                        "            <a href=\"#{}\">{}0x{:x}-0x{:x}</a>",
                        producer,
                        space.prefix(),
                        start,
                        end
                    )?;
                }
            }
            writeln!(out, "        </td>")?;
            writeln!(out, "        <td>")?;
            for (space, defs) in [
                (Space::Reg, entry.reg_def_start..entry.reg_def_end),
                (Space::Mem, entry.mem_def_start..entry.mem_def_end),
            ] {
                for def_index in defs {
                    let (start, end) = self.def_range(space, def_index);
                    writeln!(
                        out,
                        "            {}0x{:x}-0x{:x}",
                        space.prefix(),
                        start,
                        end
                    )?;
                }
            }
            writeln!(out, "        </td>")?;
            writeln!(out, "    </tr>")?;
        }
        out.write_all(b"</table>\n</body>\n</html>\n")?;
        Ok(())
    }

    /// Writes the `code`, `trace` and `uses` CSV files under `template`.
    pub fn dump_csv(&mut self, template: &PathTemplate) -> Result<(), Error> {
        self.dump_code_csv(&template.path("code"))?;
        self.dump_trace_csv(&template.path("trace"))?;
        self.dump_uses_csv(&template.path("uses"))?;
        Ok(())
    }

    fn dump_code_csv(&mut self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for code_index in 0..self.code_len() as u32 {
            writer.write_record([
                code_index.to_string(),
                self.pc_for_code(code_index).to_string(),
                hex_bytes(self.text_for_code(code_index)),
                self.disasm_text(code_index),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn dump_trace_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for (trace_index, entry) in self.trace_table().iter().enumerate() {
            writer.write_record([trace_index.to_string(), entry.code_index.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn dump_uses_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for (trace_index, entry) in self.trace_table().iter().enumerate() {
            for (space, uses) in [
                (Space::Reg, entry.reg_use_start..entry.reg_use_end),
                (Space::Mem, entry.mem_use_start..entry.mem_use_end),
            ] {
                for use_index in uses {
                    let (start, end, producer) = self.resolve(space, use_index);
                    writer.write_record([
                        trace_index.to_string(),
                        producer.to_string(),
                        space.prefix().to_string(),
                        start.to_string(),
                        end.to_string(),
                    ])?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_entities() {
        assert_eq!(
            html_escape("mov <rax>, \"&'\""),
            "mov &lt;rax&gt;, &quot;&amp;&#39;&quot;"
        );
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(hex_bytes(&[0x0f, 0x05]), "0f05");
        assert_eq!(hex_bytes(&[]), "");
    }
}
