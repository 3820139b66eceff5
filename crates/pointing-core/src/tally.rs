// Vote counting over a session's participants.

use crate::model::{Participant, Role, Session};

/// How many voters picked one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteCount {
    pub value: String,
    pub count: usize,
    /// Share of cast votes, rounded to the nearest whole percent.
    pub percentage: u32,
}

/// The leading value of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consensus {
    pub value: String,
    pub count: usize,
    pub percentage: u32,
    /// More than half of the cast votes.
    pub is_majority: bool,
    /// Strictly ahead of the runner-up without being a majority.
    pub is_plurality: bool,
}

/// Participants whose votes count. Moderators and observers are excluded.
pub fn voters(session: &Session) -> impl Iterator<Item = &Participant> {
    session
        .participants
        .iter()
        .filter(|p| p.role == Role::Participant)
}

/// `(voted, total)` over [`voters`].
pub fn vote_progress(session: &Session) -> (usize, usize) {
    voters(session).fold((0, 0), |(voted, total), p| {
        (voted + usize::from(p.has_voted), total + 1)
    })
}

/// Returns `true` when every voter has voted. Vacuously true with no voters.
pub fn all_voted(session: &Session) -> bool {
    voters(session).all(|p| p.has_voted)
}

/// Count cast votes per value, most popular first. Ties keep the order of the
/// session's voting scale.
pub fn tally(session: &Session) -> Vec<VoteCount> {
    let cast: Vec<&str> = voters(session)
        .filter(|p| p.has_voted)
        .filter_map(|p| p.vote.as_deref())
        .collect();
    let total = cast.len();
    if total == 0 {
        return Vec::new();
    }

    let mut counts: Vec<(String, usize)> = Vec::new();
    for value in cast {
        match counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value.to_string(), 1)),
        }
    }

    let scale_pos = |value: &str| {
        session
            .voting_scale
            .values
            .iter()
            .position(|v| v == value)
            .unwrap_or(usize::MAX)
    };
    counts.sort_by(|(a, na), (b, nb)| nb.cmp(na).then_with(|| scale_pos(a).cmp(&scale_pos(b))));

    counts
        .into_iter()
        .map(|(value, count)| VoteCount {
            percentage: ((count as f64 / total as f64) * 100.0).round() as u32,
            value,
            count,
        })
        .collect()
}

/// The leading value and whether it carries a majority or plurality.
pub fn consensus(session: &Session) -> Option<Consensus> {
    let results = tally(session);
    let top = results.first()?;
    let total: usize = results.iter().map(|r| r.count).sum();
    let is_majority = top.count * 2 > total;
    let is_plurality = !is_majority && results.get(1).is_some_and(|second| top.count > second.count);
    Some(Consensus {
        value: top.value.clone(),
        count: top.count,
        percentage: top.percentage,
        is_majority,
        is_plurality,
    })
}

/// The vote of `participant` as seen by `viewer_id`: always visible to the
/// voter themself, visible to everyone else only after the reveal.
pub fn visible_vote<'a>(
    session: &Session,
    viewer_id: &str,
    participant: &'a Participant,
) -> Option<&'a str> {
    if session.votes_visible || participant.id == viewer_id {
        participant.vote.as_deref()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserStory;
    use crate::scale;

    fn with_votes(votes: &[(&str, Role, Option<&str>)]) -> Session {
        let mut s = Session::create(
            "s1",
            "ABC123",
            Participant::new("mod", "Mo", Role::Moderator),
            scale::FIBONACCI.to_scale(),
            UserStory::placeholder("story-1"),
        );
        for (name, role, vote) in votes {
            let mut p = Participant::new(*name, *name, *role);
            p.vote = vote.map(str::to_string);
            p.has_voted = vote.is_some();
            s.participants.push(p);
        }
        s
    }

    #[test]
    fn observers_and_moderator_excluded() {
        let s = with_votes(&[
            ("a", Role::Participant, Some("5")),
            ("b", Role::Participant, None),
            ("c", Role::Observer, None),
        ]);
        assert_eq!(vote_progress(&s), (1, 2));
        assert!(!all_voted(&s));
    }

    #[test]
    fn all_voted_with_no_voters() {
        let s = with_votes(&[("c", Role::Observer, None)]);
        assert!(all_voted(&s));
        assert_eq!(vote_progress(&s), (0, 0));
        assert!(tally(&s).is_empty());
        assert!(consensus(&s).is_none());
    }

    #[test]
    fn tally_sorts_by_count_then_scale_order() {
        let s = with_votes(&[
            ("a", Role::Participant, Some("8")),
            ("b", Role::Participant, Some("3")),
            ("c", Role::Participant, Some("8")),
            ("d", Role::Participant, Some("2")),
        ]);
        let results = tally(&s);
        let values: Vec<&str> = results.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["8", "2", "3"]);
        assert_eq!(results[0].percentage, 50);
        assert_eq!(results[1].percentage, 25);
    }

    #[test]
    fn majority_and_plurality() {
        let majority = with_votes(&[
            ("a", Role::Participant, Some("5")),
            ("b", Role::Participant, Some("5")),
            ("c", Role::Participant, Some("8")),
        ]);
        let c = consensus(&majority).unwrap();
        assert_eq!(c.value, "5");
        assert!(c.is_majority && !c.is_plurality);
        assert_eq!(c.percentage, 67);

        let plurality = with_votes(&[
            ("a", Role::Participant, Some("5")),
            ("b", Role::Participant, Some("5")),
            ("c", Role::Participant, Some("8")),
            ("d", Role::Participant, Some("13")),
        ]);
        let c = consensus(&plurality).unwrap();
        assert!(!c.is_majority && c.is_plurality);

        let tie = with_votes(&[
            ("a", Role::Participant, Some("5")),
            ("b", Role::Participant, Some("8")),
        ]);
        let c = consensus(&tie).unwrap();
        assert!(!c.is_majority && !c.is_plurality);
    }

    #[test]
    fn hidden_votes_only_visible_to_voter() {
        let mut s = with_votes(&[("bob", Role::Participant, Some("5"))]);
        let bob = s.participant("bob").unwrap().clone();
        assert_eq!(visible_vote(&s, "bob", &bob), Some("5"));
        assert_eq!(visible_vote(&s, "mod", &bob), None);

        s.votes_visible = true;
        assert_eq!(visible_vote(&s, "mod", &bob), Some("5"));
    }
}
