use std::sync::Arc;

use plantcare_chat::prelude::*;
use plantcare_chat::{ChatRequest, ReplyEvent, start_reply};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ChatError> {
    plantcare_chat::init_observability();
    let config = ChatConfig::from_env()?;
    let transport = HttpChatTransport::new(&config, Arc::new(Anonymous))?;

    let mut reply = start_reply(
        Arc::new(transport),
        ChatRequest::new("Low-light plants for a small flat?", Vec::new()),
        config.stream_buffer_capacity,
    )?;

    while let Some(event) = reply.next_event().await {
        match event {
            ReplyEvent::Delta { delta, .. } => match delta {
                SegmentDelta::Intro(text) | SegmentDelta::Summary(text) => print!("{text}"),
                SegmentDelta::JsonOpened => println!("\n[finding plants...]"),
                SegmentDelta::Plants(plants) => {
                    for plant in plants {
                        println!("- {}: {}", plant.common_name, plant.description);
                    }
                }
            },
            ReplyEvent::Completed { .. } => println!(),
            ReplyEvent::Failed { error, .. } => eprintln!("reply error: {error}"),
            ReplyEvent::Started { .. } => {}
        }
    }

    let outcome = reply.finish().await?;
    if let Some(degradation) = outcome.degradation {
        eprintln!("note: {degradation}");
    }
    Ok(())
}
