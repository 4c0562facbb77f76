use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PlayerId = String;
pub type QuestionId = String;
pub type DecoyId = String;

pub const DEFAULT_DECOYS_PER_QUESTION: usize = 3;

/// How many times a contended slot is re-selected before giving up.
const SLOT_ASSIGN_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub text: String,
    /// Ground truth. Never shown to players until the summary.
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub score: i64,
}

/// A player-submitted fake answer occupying one presentation slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decoy {
    pub id: DecoyId,
    pub question_id: QuestionId,
    pub author: PlayerId,
    pub text: String,
    pub slot: usize,
}

/// `choice` is None when the voter picked the real answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vote {
    pub voter: PlayerId,
    pub question_id: QuestionId,
    pub choice: Option<DecoyId>,
}

/// Point values, stored per game rather than hard-coded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scoring {
    pub truth: i64,
    pub self_pick: i64,
    pub fooled: i64,
}

impl Default for Scoring {
    fn default() -> Self {
        Self {
            truth: 3,
            self_pick: -3,
            fooled: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    AwaitingQuestion,
    CollectingAnswers,
    Voting,
    Summary,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Game {
    pub id: String,
    pub topic: Topic,
    pub decoys_per_question: usize,
    pub current: Option<QuestionId>,
    /// Append-only, deduplicated by `advance_round`.
    pub asked: Vec<QuestionId>,
    pub players: Vec<Player>,
    pub decoys: Vec<Decoy>,
    pub votes: Vec<Vote>,
    #[serde(default)]
    pub scoring: Scoring,
}

impl Game {
    pub fn new(id: impl Into<String>, topic: Topic, decoys_per_question: usize) -> Self {
        Self {
            id: id.into(),
            topic,
            decoys_per_question: decoys_per_question.max(1),
            current: None,
            asked: Vec::new(),
            players: Vec::new(),
            decoys: Vec::new(),
            votes: Vec::new(),
            scoring: Scoring::default(),
        }
    }

    /// Phase is derived from counts so it cannot drift from the data.
    pub fn phase(&self) -> GamePhase {
        match &self.current {
            Some(question_id) => {
                if self.decoys_for(question_id).count() < self.decoys_per_question {
                    GamePhase::CollectingAnswers
                } else if self.players.is_empty()
                    || self.votes_for(question_id).count() < self.players.len()
                {
                    GamePhase::Voting
                } else {
                    GamePhase::Summary
                }
            }
            None if !self.topic.questions.is_empty() && self.unasked().is_empty() => {
                GamePhase::Ended
            }
            None => GamePhase::AwaitingQuestion,
        }
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    fn player_mut(&mut self, id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.id == id)
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.topic.questions.iter().find(|q| q.id == id)
    }

    pub fn decoys_for<'a>(&'a self, question_id: &'a str) -> impl Iterator<Item = &'a Decoy> + 'a {
        self.decoys
            .iter()
            .filter(move |d| d.question_id == question_id)
    }

    pub fn votes_for<'a>(&'a self, question_id: &'a str) -> impl Iterator<Item = &'a Vote> + 'a {
        self.votes
            .iter()
            .filter(move |v| v.question_id == question_id)
    }

    /// Questions never asked and not currently open.
    pub fn unasked(&self) -> Vec<&Question> {
        self.topic
            .questions
            .iter()
            .filter(|q| {
                !self.asked.contains(&q.id) && self.current.as_deref() != Some(q.id.as_str())
            })
            .collect()
    }

    /// Slots in `0..=decoys_per_question` not occupied by a decoy.
    pub fn free_slots(&self, question_id: &str) -> Vec<usize> {
        let taken: HashSet<usize> = self.decoys_for(question_id).map(|d| d.slot).collect();
        (0..=self.decoys_per_question)
            .filter(|slot| !taken.contains(slot))
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("topic `{0}` has no questions")]
    NoQuestions(String),
    #[error("no question is open")]
    NoOpenQuestion,
    #[error("question not found")]
    QuestionNotFound,
    #[error("player not found")]
    PlayerNotFound,
    #[error("slot {0} is already taken")]
    SlotTaken(usize),
    #[error("expected exactly one free slot, found {0}")]
    BrokenSlotLayout(usize),
    #[error("gave up assigning a slot after {0} attempts")]
    SlotContention(usize),
    #[error("slot {0} does not match any quiz entry")]
    UnknownSlot(usize),
    #[error("voting is not open")]
    VotingClosed,
}

/// Guarantees an open question before a player-facing operation proceeds.
///
/// Returns the already-open question when one exists, so a caller that lost
/// the assignment race simply observes the winner's pick. `Ok(None)` means
/// the pool is exhausted and the round is over; an empty topic is a fatal
/// configuration error.
pub fn ensure_open_question<R: Rng>(
    game: &mut Game,
    rng: &mut R,
) -> Result<Option<QuestionId>, GameError> {
    if let Some(id) = &game.current {
        return Ok(Some(id.clone()));
    }
    if game.topic.questions.is_empty() {
        return Err(GameError::NoQuestions(game.topic.name.clone()));
    }
    let next = game.unasked().choose(rng).map(|q| q.id.clone());
    game.current = next.clone();
    Ok(next)
}

/// Create-or-fetch a player by display name. A known name rejoins as the
/// existing player; otherwise `candidate_id` is bound to a fresh one.
pub fn join_player(game: &mut Game, candidate_id: PlayerId, name: &str) -> PlayerId {
    let name = name.trim();
    if let Some(existing) = game.players.iter().find(|p| p.name == name) {
        return existing.id.clone();
    }
    game.players.push(Player {
        id: candidate_id.clone(),
        name: name.to_string(),
        score: 0,
    });
    candidate_id
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { slot: usize },
    /// Identical text already collected for this question.
    Duplicate,
    /// The player guessed the real answer; nothing is stored and the caller
    /// must respond exactly as for an accepted submission.
    MatchesTruth,
    /// The decoy set is already full; the submission is dropped.
    CollectionFull,
}

/// Collect one decoy for the open question.
///
/// Slot assignment is a compare-and-swap: read the taken slots, pick a free
/// one uniformly, attempt an insert that re-checks uniqueness, and on a
/// collision re-read and re-select, a bounded number of times.
pub fn submit_decoy<R: Rng>(
    game: &mut Game,
    author: &str,
    decoy_id: DecoyId,
    text: &str,
    rng: &mut R,
) -> Result<SubmitOutcome, GameError> {
    if game.player(author).is_none() {
        return Err(GameError::PlayerNotFound);
    }
    let question_id = game.current.clone().ok_or(GameError::NoOpenQuestion)?;
    let question = game
        .question(&question_id)
        .ok_or(GameError::QuestionNotFound)?;

    let text = text.trim();
    if text.eq_ignore_ascii_case(question.answer.trim()) {
        return Ok(SubmitOutcome::MatchesTruth);
    }
    if game
        .decoys_for(&question_id)
        .any(|d| d.text.eq_ignore_ascii_case(text))
    {
        return Ok(SubmitOutcome::Duplicate);
    }
    if game.decoys_for(&question_id).count() >= game.decoys_per_question {
        return Ok(SubmitOutcome::CollectionFull);
    }

    let text = text.to_string();
    for _ in 0..SLOT_ASSIGN_ATTEMPTS {
        let free = game.free_slots(&question_id);
        let Some(&slot) = free.choose(rng) else {
            return Err(GameError::BrokenSlotLayout(0));
        };
        match insert_decoy(
            game,
            Decoy {
                id: decoy_id.clone(),
                question_id: question_id.clone(),
                author: author.to_string(),
                text: text.clone(),
                slot,
            },
        ) {
            Ok(()) => return Ok(SubmitOutcome::Accepted { slot }),
            Err(GameError::SlotTaken(_)) => continue,
            Err(other) => return Err(other),
        }
    }
    Err(GameError::SlotContention(SLOT_ASSIGN_ATTEMPTS))
}

fn insert_decoy(game: &mut Game, decoy: Decoy) -> Result<(), GameError> {
    if game
        .decoys_for(&decoy.question_id)
        .any(|d| d.slot == decoy.slot)
    {
        return Err(GameError::SlotTaken(decoy.slot));
    }
    game.decoys.push(decoy);
    Ok(())
}

/// One voting-list entry. Authorship is deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizEntry {
    pub slot: usize,
    pub text: String,
}

/// The single slot left free by the decoys carries the real answer.
pub fn truth_slot(game: &Game, question_id: &str) -> Result<usize, GameError> {
    let free = game.free_slots(question_id);
    if free.len() != 1 {
        return Err(GameError::BrokenSlotLayout(free.len()));
    }
    Ok(free[0])
}

/// Merge the decoys and the real answer into the slot-ordered voting list.
pub fn compose_quiz(game: &Game, question_id: &str) -> Result<Vec<QuizEntry>, GameError> {
    let question = game
        .question(question_id)
        .ok_or(GameError::QuestionNotFound)?;
    let truth = truth_slot(game, question_id)?;
    let mut entries: Vec<QuizEntry> = game
        .decoys_for(question_id)
        .map(|d| QuizEntry {
            slot: d.slot,
            text: d.text.clone(),
        })
        .collect();
    entries.push(QuizEntry {
        slot: truth,
        text: question.answer.clone(),
    });
    entries.sort_by_key(|e| e.slot);
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    FoundTruth,
    PickedOwn,
    FooledBy { author: PlayerId },
    AlreadyVoted,
}

/// Record one ballot and apply its scoring effect in the same mutation.
///
/// Idempotent per voter and question. A slot matching neither a decoy nor
/// the reserved truth slot is rejected outright.
pub fn record_vote(
    game: &mut Game,
    voter: &str,
    chosen_slot: usize,
) -> Result<VoteOutcome, GameError> {
    if game.player(voter).is_none() {
        return Err(GameError::PlayerNotFound);
    }
    let question_id = game.current.clone().ok_or(GameError::NoOpenQuestion)?;
    if game.decoys_for(&question_id).count() < game.decoys_per_question {
        return Err(GameError::VotingClosed);
    }
    if game.votes_for(&question_id).any(|v| v.voter == voter) {
        return Ok(VoteOutcome::AlreadyVoted);
    }

    let truth = truth_slot(game, &question_id)?;
    let choice = if chosen_slot == truth {
        None
    } else {
        match game
            .decoys_for(&question_id)
            .find(|d| d.slot == chosen_slot)
        {
            Some(decoy) => Some((decoy.id.clone(), decoy.author.clone())),
            None => return Err(GameError::UnknownSlot(chosen_slot)),
        }
    };

    let scoring = game.scoring;
    let (chosen_decoy, outcome) = match choice {
        None => {
            game.player_mut(voter)
                .ok_or(GameError::PlayerNotFound)?
                .score += scoring.truth;
            (None, VoteOutcome::FoundTruth)
        }
        Some((decoy_id, author)) if author == voter => {
            game.player_mut(voter)
                .ok_or(GameError::PlayerNotFound)?
                .score += scoring.self_pick;
            (Some(decoy_id), VoteOutcome::PickedOwn)
        }
        Some((decoy_id, author)) => {
            game.player_mut(&author)
                .ok_or(GameError::PlayerNotFound)?
                .score += scoring.fooled;
            (Some(decoy_id), VoteOutcome::FooledBy { author })
        }
    };
    game.votes.push(Vote {
        voter: voter.to_string(),
        question_id,
        choice: chosen_decoy,
    });
    Ok(outcome)
}

pub fn ready_to_advance(game: &Game) -> bool {
    match &game.current {
        Some(question_id) => {
            !game.players.is_empty() && game.votes_for(question_id).count() >= game.players.len()
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced(Option<QuestionId>),
    /// The caller's expectation was out of date; carries what is open now.
    Stale(Option<QuestionId>),
}

/// Mark the expected question asked and open the next one, or end the round.
///
/// Check-and-set keyed on `expected`: a caller racing against an advancement
/// that already happened observes the new state instead of re-advancing.
pub fn advance_round<R: Rng>(
    game: &mut Game,
    expected: &str,
    rng: &mut R,
) -> Result<AdvanceOutcome, GameError> {
    if game.current.as_deref() != Some(expected) {
        return Ok(AdvanceOutcome::Stale(game.current.clone()));
    }
    if !game.asked.iter().any(|id| id == expected) {
        game.asked.push(expected.to_string());
    }
    game.current = None;
    let next = game.unasked().choose(rng).map(|q| q.id.clone());
    game.current = next.clone();
    Ok(AdvanceOutcome::Advanced(next))
}
