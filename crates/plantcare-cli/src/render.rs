//! Incremental terminal rendering of an assistant message.

use std::io::{self, Write};

use plantcare_chat::{ConversationMessage, MessageStatus, PlantSummary};

/// Prints only what changed since the previous render of the same message.
#[derive(Debug, Default)]
pub struct StagedPrinter {
    status: Option<MessageStatus>,
    intro_len: usize,
    plants_shown: bool,
    summary_len: usize,
}

impl StagedPrinter {
    pub fn render(&mut self, message: &ConversationMessage, out: &mut dyn Write) -> io::Result<()> {
        self.intro_len = write_tail(message.intro(), self.intro_len, out)?;

        if !self.plants_shown
            && let Some(plants) = &message.json_plants
        {
            write_plants(plants, out)?;
            self.plants_shown = true;
        }

        self.summary_len = write_tail(message.summary(), self.summary_len, out)?;

        if message.status != self.status {
            if let Some(status) = message.status {
                writeln!(out, "\n[{status}]")?;
            }
            self.status = message.status;
        }
        out.flush()
    }
}

fn write_tail(text: &str, printed: usize, out: &mut dyn Write) -> io::Result<usize> {
    match text.get(printed..) {
        Some(tail) if !tail.is_empty() => {
            write!(out, "{tail}")?;
            Ok(text.len())
        }
        _ => Ok(printed),
    }
}

pub fn write_plants(plants: &[PlantSummary], out: &mut dyn Write) -> io::Result<()> {
    writeln!(out)?;
    if plants.is_empty() {
        return writeln!(out, "  (no plant recommendations)");
    }
    for plant in plants {
        writeln!(out, "  * {}: {}", plant.common_name, plant.description)?;
        if !plant.image_url.is_empty() {
            writeln!(out, "    {}", plant.image_url)?;
        }
    }
    Ok(())
}
