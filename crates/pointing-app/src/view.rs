// Plain-text rendering of a client's session view.

use std::fmt::Write;

use pointing_core::model::Role;
use pointing_core::reconciler::ClientSession;
use pointing_core::route;
use pointing_core::tally;

/// Render the session as seen by the local participant.
pub fn render(client: &ClientSession) -> String {
    let s = &client.session;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Room {} ({})  scale: {} [{}]",
        s.room_code,
        route::share_path(&s.room_code),
        s.voting_scale.name,
        s.voting_scale.values.join(" ")
    );

    match s.current_story() {
        Some(story) => {
            let _ = writeln!(
                out,
                "Story {}/{}: {}",
                s.current_story_index + 1,
                s.user_stories.len(),
                story.title
            );
            if !story.description.is_empty() {
                let _ = writeln!(out, "  {}", story.description);
            }
            if let Some(estimate) = &story.estimate {
                let _ = writeln!(out, "  estimate: {estimate}");
            }
            if story.is_completed {
                let _ = writeln!(out, "  (completed)");
            }
        }
        None => {
            let _ = writeln!(out, "No stories");
        }
    }

    let (voted, total) = tally::vote_progress(s);
    let _ = writeln!(out, "Participants ({voted}/{total} voted):");
    for p in &s.participants {
        let marker = if p.id == client.participant_id { "*" } else { " " };
        let status = match p.role {
            Role::Moderator => "moderator".to_string(),
            Role::Observer => "observer".to_string(),
            Role::Participant => match tally::visible_vote(s, &client.participant_id, p) {
                Some(vote) => format!("voted {vote}"),
                None if p.has_voted => "voted".to_string(),
                None => "waiting".to_string(),
            },
        };
        let _ = writeln!(out, " {marker} {} [{status}]", p.name);
    }

    if s.votes_visible {
        let results = tally::tally(s);
        if results.is_empty() {
            let _ = writeln!(out, "Votes revealed: none cast");
        } else {
            let counts: Vec<String> = results
                .iter()
                .map(|r| format!("{} x{} ({}%)", r.value, r.count, r.percentage))
                .collect();
            let _ = writeln!(out, "Votes revealed: {}", counts.join(", "));
        }
        if let Some(c) = tally::consensus(s) {
            let kind = if c.is_majority {
                "majority"
            } else if c.is_plurality {
                "plurality"
            } else {
                "no consensus"
            };
            let _ = writeln!(out, "Leading: {} ({kind})", c.value);
        }
    } else if tally::all_voted(s) && total > 0 {
        let _ = writeln!(out, "Everyone has voted");
    }

    out
}
