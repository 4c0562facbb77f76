use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use game_core::{
    AdvanceOutcome, Game, GameError, GamePhase, Player, Question, QuizEntry, Topic,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_sessions::{MemoryStore, Session, SessionManagerLayer};
use uuid::Uuid;

const PLAYER_SESSION_KEY: &str = "player_id";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RwLock<Registry>>,
    topics: Arc<Vec<Topic>>,
    persist_path: Option<PathBuf>,
}

/// All game state plus the explicit id of the game requests act on.
/// The active id is written only by `/manage/start_new` and resolved once
/// per request, never re-queried mid-operation.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    games: HashMap<String, Game>,
    active: Option<String>,
}

impl Registry {
    fn active_game(&self) -> Option<&Game> {
        self.active.as_ref().and_then(|id| self.games.get(id))
    }

    fn active_game_mut(&mut self) -> Option<&mut Game> {
        let id = self.active.clone()?;
        self.games.get_mut(&id)
    }
}

impl AppState {
    pub fn new(topics: Vec<Topic>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            topics: Arc::new(topics),
            persist_path: None,
        }
    }

    pub async fn with_persistence(topics: Vec<Topic>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = Self::new(topics);
        state.persist_path = Some(path.clone());
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(saved) = serde_json::from_slice::<Registry>(&bytes) {
                let mut registry = state.registry.write().await;
                *registry = saved;
            }
        }
        state
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let snapshot = {
            let registry = self.registry.read().await;
            serde_json::to_vec_pretty(&*registry)
        };
        match snapshot {
            Ok(json) => {
                if let Err(err) = tokio::fs::write(path, json).await {
                    tracing::warn!(%err, "failed to persist registry");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to serialize registry"),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);
    Router::new()
        .route("/", get(index))
        .route("/register", post(register))
        .route("/open_question", post(open_question))
        .route("/quiz", post(answer_quiz))
        .route("/summary/:question_id", get(summary))
        .route("/manage", get(manage))
        .route("/manage/start_new", post(start_new))
        .route("/manage/next", post(next_question))
        .route("/api/cur_question", get(cur_question))
        .layer(session_layer)
        .with_state(state)
}

fn admin_password() -> String {
    env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".to_string())
}

fn require_admin(headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != admin_password() {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PlayerView {
    name: String,
    score: i64,
}

#[derive(Debug, Serialize)]
struct QuestionView {
    id: String,
    text: String,
}

/// What `GET /` renders for the session's player, one variant per screen.
#[derive(Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum StateView {
    Welcome {
        game_open: bool,
    },
    OpenQuestion {
        question: QuestionView,
        player: PlayerView,
        submitted: bool,
        decoys: usize,
        decoys_needed: usize,
    },
    Quiz {
        question: QuestionView,
        player: PlayerView,
        entries: Vec<QuizEntry>,
        voted: bool,
    },
    Summary {
        question: QuestionView,
        player: PlayerView,
    },
    Ended {
        player: PlayerView,
        scoreboard: Vec<PlayerView>,
    },
}

fn scoreboard(game: &Game) -> Vec<PlayerView> {
    let mut rows: Vec<PlayerView> = game
        .players
        .iter()
        .map(|p| PlayerView {
            name: p.name.clone(),
            score: p.score,
        })
        .collect();
    rows.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    rows
}

fn state_view(game: &Game, player: &Player) -> Result<StateView, ApiError> {
    let player_view = PlayerView {
        name: player.name.clone(),
        score: player.score,
    };
    let phase = game.phase();
    let question_id = match phase {
        GamePhase::AwaitingQuestion => return Ok(StateView::Welcome { game_open: true }),
        GamePhase::Ended => {
            return Ok(StateView::Ended {
                player: player_view,
                scoreboard: scoreboard(game),
            })
        }
        _ => game.current.clone().ok_or(GameError::NoOpenQuestion)?,
    };
    let question = game
        .question(&question_id)
        .ok_or(GameError::QuestionNotFound)?;
    let question_view = QuestionView {
        id: question.id.clone(),
        text: question.text.clone(),
    };
    match phase {
        GamePhase::CollectingAnswers => Ok(StateView::OpenQuestion {
            submitted: game.decoys_for(&question_id).any(|d| d.author == player.id),
            decoys: game.decoys_for(&question_id).count(),
            decoys_needed: game.decoys_per_question,
            question: question_view,
            player: player_view,
        }),
        GamePhase::Voting => Ok(StateView::Quiz {
            entries: game_core::compose_quiz(game, &question_id)?,
            voted: game.votes_for(&question_id).any(|v| v.voter == player.id),
            question: question_view,
            player: player_view,
        }),
        _ => Ok(StateView::Summary {
            question: question_view,
            player: player_view,
        }),
    }
}

async fn index(session: Session, State(state): State<AppState>) -> Result<Response, ApiError> {
    let player_id: Option<String> = session.get(PLAYER_SESSION_KEY).await?;

    let awaiting = {
        let registry = state.registry.read().await;
        matches!(
            registry.active_game(),
            Some(game) if game.phase() == GamePhase::AwaitingQuestion
        )
    };
    if awaiting {
        let opened = {
            let mut registry = state.registry.write().await;
            match registry.active_game_mut() {
                // Double-checked under the write lock; a losing racer finds
                // the question already assigned and just renders it.
                Some(game) if game.current.is_none() => {
                    let mut rng = ChaCha8Rng::from_entropy();
                    game_core::ensure_open_question(game, &mut rng)?.is_some()
                }
                _ => false,
            }
        };
        if opened {
            state.persist().await;
        }
    }

    let registry = state.registry.read().await;
    let Some(game) = registry.active_game() else {
        return Ok(Json(StateView::Welcome { game_open: false }).into_response());
    };
    let player = player_id.as_deref().and_then(|id| game.player(id));
    let Some(player) = player else {
        return Ok(Json(StateView::Welcome { game_open: true }).into_response());
    };
    Ok(Json(state_view(game, player)?).into_response())
}

#[derive(Debug, Deserialize)]
struct RegisterForm {
    name: String,
}

async fn register(
    session: Session,
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Result<Response, ApiError> {
    let name = form.name.trim().to_string();
    if name.is_empty() {
        return Ok(Redirect::to("/").into_response());
    }
    let player_id = {
        let mut registry = state.registry.write().await;
        let Some(game) = registry.active_game_mut() else {
            return Ok(Redirect::to("/").into_response());
        };
        game_core::join_player(game, Uuid::new_v4().to_string(), &name)
    };
    session.insert(PLAYER_SESSION_KEY, player_id).await?;
    state.persist().await;
    tracing::info!(player = %name, "player registered");
    Ok(Redirect::to("/").into_response())
}

#[derive(Debug, Deserialize)]
struct DecoyForm {
    answer: String,
}

async fn open_question(
    session: Session,
    State(state): State<AppState>,
    Form(form): Form<DecoyForm>,
) -> Result<Response, ApiError> {
    let Some(player_id) = session.get::<String>(PLAYER_SESSION_KEY).await? else {
        return Ok(Redirect::to("/").into_response());
    };
    {
        let mut registry = state.registry.write().await;
        let Some(game) = registry.active_game_mut() else {
            return Ok(Redirect::to("/").into_response());
        };
        let mut rng = ChaCha8Rng::from_entropy();
        if game_core::ensure_open_question(game, &mut rng)?.is_none() {
            return Ok(Redirect::to("/").into_response());
        }
        match game_core::submit_decoy(
            game,
            &player_id,
            Uuid::new_v4().to_string(),
            &form.answer,
            &mut rng,
        ) {
            // Every outcome gets the identical redirect, so a truth guess is
            // indistinguishable from an accepted decoy.
            Ok(outcome) => tracing::debug!(game = %game.id, ?outcome, "decoy submission"),
            // Session left over from an older game.
            Err(GameError::PlayerNotFound) => return Ok(Redirect::to("/").into_response()),
            Err(err) => return Err(err.into()),
        }
    }
    state.persist().await;
    Ok(Redirect::to("/").into_response())
}

#[derive(Debug, Deserialize)]
struct BallotForm {
    answer: String,
}

async fn answer_quiz(
    session: Session,
    State(state): State<AppState>,
    Form(form): Form<BallotForm>,
) -> Result<Response, ApiError> {
    let Some(player_id) = session.get::<String>(PLAYER_SESSION_KEY).await? else {
        return Ok(Redirect::to("/").into_response());
    };
    let Ok(slot) = form.answer.trim().parse::<usize>() else {
        tracing::warn!(ballot = %form.answer, "discarding unparseable ballot");
        return Ok(Redirect::to("/").into_response());
    };
    {
        let mut registry = state.registry.write().await;
        let Some(game) = registry.active_game_mut() else {
            return Ok(Redirect::to("/").into_response());
        };
        match game_core::record_vote(game, &player_id, slot) {
            Ok(outcome) => tracing::debug!(game = %game.id, ?outcome, "ballot recorded"),
            Err(GameError::UnknownSlot(slot)) => {
                tracing::warn!(slot, "discarding ballot for an unknown slot");
                return Ok(Redirect::to("/").into_response());
            }
            Err(
                GameError::PlayerNotFound | GameError::VotingClosed | GameError::NoOpenQuestion,
            ) => return Ok(Redirect::to("/").into_response()),
            Err(err) => return Err(err.into()),
        }
    }
    state.persist().await;
    Ok(Redirect::to("/").into_response())
}

#[derive(Debug, Serialize)]
struct SummaryEntryView {
    slot: usize,
    text: String,
    /// Author display name; None for the real answer.
    author: Option<String>,
    votes: usize,
    truth: bool,
}

#[derive(Debug, Serialize)]
struct SummaryView {
    question: QuestionView,
    entries: Vec<SummaryEntryView>,
    scoreboard: Vec<PlayerView>,
    current: Option<String>,
    ended: bool,
}

async fn summary(
    Path(question_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    // Viewing the summary of the question everyone has voted on is what
    // advances the round; stale viewers fall through to the report below.
    let advanced = {
        let mut registry = state.registry.write().await;
        match registry.active_game_mut() {
            Some(game)
                if game.current.as_deref() == Some(question_id.as_str())
                    && game_core::ready_to_advance(game) =>
            {
                let mut rng = ChaCha8Rng::from_entropy();
                let outcome = game_core::advance_round(game, &question_id, &mut rng)?;
                tracing::info!(game = %game.id, ?outcome, "round advanced");
                true
            }
            _ => false,
        }
    };
    if advanced {
        state.persist().await;
    }

    let registry = state.registry.read().await;
    let game = registry.active_game().ok_or(ApiError::NoActiveGame)?;
    let question = game
        .question(&question_id)
        .ok_or(ApiError::QuestionNotFound)?;

    // The strict one-free-slot invariant is enforced at quiz composition and
    // vote resolution; the report places the truth at the first free slot so
    // an operator force-skip still renders.
    let free = game.free_slots(&question_id);
    let truth = *free.first().ok_or(GameError::BrokenSlotLayout(0))?;

    let mut entries: Vec<SummaryEntryView> = game
        .decoys_for(&question_id)
        .map(|d| SummaryEntryView {
            slot: d.slot,
            text: d.text.clone(),
            author: game.player(&d.author).map(|p| p.name.clone()),
            votes: game
                .votes_for(&question_id)
                .filter(|v| v.choice.as_deref() == Some(d.id.as_str()))
                .count(),
            truth: false,
        })
        .collect();
    entries.push(SummaryEntryView {
        slot: truth,
        text: question.answer.clone(),
        author: None,
        votes: game
            .votes_for(&question_id)
            .filter(|v| v.choice.is_none())
            .count(),
        truth: true,
    });
    entries.sort_by_key(|e| e.slot);

    Ok(Json(SummaryView {
        question: QuestionView {
            id: question.id.clone(),
            text: question.text.clone(),
        },
        entries,
        scoreboard: scoreboard(game),
        current: game.current.clone(),
        ended: game.phase() == GamePhase::Ended,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
struct ManageQuestionView {
    id: String,
    text: String,
    answer: String,
}

#[derive(Debug, Serialize)]
struct ManageView {
    game_id: String,
    topic: String,
    phase: GamePhase,
    players: usize,
    decoys: usize,
    decoys_needed: usize,
    votes: usize,
    question: Option<ManageQuestionView>,
}

async fn manage(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    require_admin(&headers)?;
    let registry = state.registry.read().await;
    let game = registry.active_game().ok_or(ApiError::NoActiveGame)?;
    let question = match &game.current {
        Some(id) => {
            let q = game.question(id).ok_or(ApiError::QuestionNotFound)?;
            Some(ManageQuestionView {
                id: q.id.clone(),
                text: q.text.clone(),
                answer: q.answer.clone(),
            })
        }
        None => None,
    };
    let (decoys, votes) = match &game.current {
        Some(id) => (game.decoys_for(id).count(), game.votes_for(id).count()),
        None => (0, 0),
    };
    Ok(Json(ManageView {
        game_id: game.id.clone(),
        topic: game.topic.name.clone(),
        phase: game.phase(),
        players: game.players.len(),
        decoys,
        decoys_needed: game.decoys_per_question,
        votes,
        question,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct StartNewForm {
    topic: String,
    num_answers: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct StartNewResponse {
    game_id: String,
    question_id: Option<String>,
}

async fn start_new(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<StartNewForm>,
) -> Result<Response, ApiError> {
    require_admin(&headers)?;
    let topic = state
        .topics
        .iter()
        .find(|t| t.name == form.topic)
        .cloned()
        .ok_or_else(|| ApiError::UnknownTopic(form.topic.clone()))?;

    let decoys_per_question = form
        .num_answers
        .unwrap_or(game_core::DEFAULT_DECOYS_PER_QUESTION);
    let game_id = Uuid::new_v4().to_string();
    let mut game = Game::new(game_id.clone(), topic, decoys_per_question);
    let mut rng = form
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);
    let question_id = game_core::ensure_open_question(&mut game, &mut rng)?;

    {
        let mut registry = state.registry.write().await;
        registry.games.insert(game_id.clone(), game);
        registry.active = Some(game_id.clone());
    }
    state.persist().await;
    tracing::info!(game = %game_id, topic = %form.topic, "new round started");

    Ok((
        StatusCode::CREATED,
        Json(StartNewResponse {
            game_id,
            question_id,
        }),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct NextResponse {
    current: Option<String>,
}

async fn next_question(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&headers)?;
    let current = {
        let mut registry = state.registry.write().await;
        let game = registry.active_game_mut().ok_or(ApiError::NoActiveGame)?;
        let mut rng = ChaCha8Rng::from_entropy();
        match game.current.clone() {
            Some(expected) => match game_core::advance_round(game, &expected, &mut rng)? {
                AdvanceOutcome::Advanced(next) | AdvanceOutcome::Stale(next) => next,
            },
            None => game_core::ensure_open_question(game, &mut rng)?,
        }
    };
    state.persist().await;
    tracing::info!(current = ?current, "operator advanced the round");
    Ok(Json(NextResponse { current }).into_response())
}

#[derive(Debug, Serialize)]
struct CurQuestionView {
    cur: Option<String>,
    is_quiz: bool,
}

async fn cur_question(State(state): State<AppState>) -> Json<CurQuestionView> {
    let registry = state.registry.read().await;
    match registry.active_game() {
        Some(game) => Json(CurQuestionView {
            cur: game.current.clone(),
            is_quiz: game.phase() == GamePhase::Voting,
        }),
        None => Json(CurQuestionView {
            cur: None,
            is_quiz: false,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("invalid admin password")]
    Unauthorized,
    #[error("no active game")]
    NoActiveGame,
    #[error("question not found")]
    QuestionNotFound,
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    #[error(transparent)]
    Game(#[from] GameError),
    #[error("session store error: {0}")]
    Session(#[from] tower_sessions::session::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NoActiveGame | ApiError::QuestionNotFound => StatusCode::NOT_FOUND,
            ApiError::UnknownTopic(_) => StatusCode::BAD_REQUEST,
            ApiError::Game(
                GameError::NoQuestions(_)
                | GameError::BrokenSlotLayout(_)
                | GameError::SlotContention(_),
            )
            | ApiError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Game(_) => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopicsError {
    #[error("could not read topics file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse topics file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct TopicConfig {
    name: String,
    questions: Vec<QuestionConfig>,
}

#[derive(Debug, Deserialize)]
struct QuestionConfig {
    text: String,
    answer: String,
}

pub async fn load_topics(path: impl AsRef<std::path::Path>) -> Result<Vec<Topic>, TopicsError> {
    let bytes = tokio::fs::read(path).await?;
    let configs: Vec<TopicConfig> = serde_json::from_slice(&bytes)?;
    Ok(configs
        .into_iter()
        .map(|topic| Topic {
            name: topic.name,
            questions: topic
                .questions
                .into_iter()
                .map(|q| Question {
                    id: Uuid::new_v4().to_string(),
                    text: q.text,
                    answer: q.answer,
                })
                .collect(),
        })
        .collect())
}

/// Built-in demo pools so the server is playable without a topics file.
pub fn sample_topics() -> Vec<Topic> {
    let topic = |name: &str, questions: &[(&str, &str)]| Topic {
        name: name.to_string(),
        questions: questions
            .iter()
            .map(|(text, answer)| Question {
                id: Uuid::new_v4().to_string(),
                text: text.to_string(),
                answer: answer.to_string(),
            })
            .collect(),
    };
    vec![
        topic(
            "Movies",
            &[
                (
                    "What was 'Snakes on a Plane' called while it was being written?",
                    "Pacific Air Flight 121",
                ),
                (
                    "What prop did Alfred Hitchcock appear in for his 'Lifeboat' cameo?",
                    "A newspaper weight-loss ad",
                ),
                (
                    "Which 1927 film was the first to win Best Picture?",
                    "Wings",
                ),
            ],
        ),
        topic(
            "Odd Science",
            &[
                (
                    "What household product was Play-Doh originally sold as?",
                    "Wallpaper cleaner",
                ),
                (
                    "What did the first webcam ever deployed point at?",
                    "A coffee pot",
                ),
                (
                    "What fruit shares roughly 60 percent of its genes with humans?",
                    "Banana",
                ),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn question(id: &str, text: &str, answer: &str) -> Question {
        Question {
            id: id.to_string(),
            text: text.to_string(),
            answer: answer.to_string(),
        }
    }

    fn test_topics() -> Vec<Topic> {
        vec![
            Topic {
                name: "Movies".to_string(),
                questions: vec![
                    question("q1", "Sequel to Titanic?", "There is none"),
                    question("q2", "First feature-length animated film?", "Snow White"),
                    question("q3", "Highest-grossing film of 1997?", "Titanic"),
                ],
            },
            Topic {
                name: "Tiny".to_string(),
                questions: vec![question("t1", "Only question?", "Yes")],
            },
            Topic {
                name: "Empty".to_string(),
                questions: vec![],
            },
        ]
    }

    fn answer_for(text: &str) -> String {
        test_topics()
            .into_iter()
            .flat_map(|t| t.questions)
            .find(|q| q.text == text)
            .expect("fixture question")
            .answer
    }

    fn test_app() -> Router {
        app(AppState::new(test_topics()))
    }

    async fn json_body(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get_with(app: &Router, uri: &str, cookie: Option<&str>) -> Response {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        app.clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn get_admin(app: &Router, uri: &str) -> Response {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("x-admin-password", "changeme")
            .body(Body::empty())
            .unwrap();
        app.clone().oneshot(req).await.unwrap()
    }

    async fn post_form(
        app: &Router,
        uri: &str,
        cookie: Option<&str>,
        admin: bool,
        body: &str,
    ) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            );
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        if admin {
            builder = builder.header("x-admin-password", "changeme");
        }
        app.clone()
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
    }

    fn session_cookie(res: &Response) -> String {
        res.headers()
            .get(header::SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string()
    }

    fn form_value(text: &str) -> String {
        text.replace(' ', "+")
    }

    async fn start_round(app: &Router, body: &str) -> serde_json::Value {
        let res = post_form(app, "/manage/start_new", None, true, body).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await
    }

    async fn register_player(app: &Router, name: &str) -> String {
        let res = post_form(app, "/register", None, false, &format!("name={name}")).await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
        session_cookie(&res)
    }

    async fn submit_decoy(app: &Router, cookie: &str, text: &str) {
        let res = post_form(
            app,
            "/open_question",
            Some(cookie),
            false,
            &format!("answer={}", form_value(text)),
        )
        .await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
    }

    async fn cast_ballot(app: &Router, cookie: &str, ballot: &str) {
        let res = post_form(
            app,
            "/quiz",
            Some(cookie),
            false,
            &format!("answer={ballot}"),
        )
        .await;
        assert_eq!(res.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn starting_a_round_requires_the_admin_password() {
        let app = test_app();
        let res = post_form(&app, "/manage/start_new", None, false, "topic=Movies").await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = get_with(&app, "/manage", None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_topics_are_rejected() {
        let app = test_app();
        let res = post_form(&app, "/manage/start_new", None, true, "topic=Nope").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn a_topic_without_questions_is_a_server_error() {
        let app = test_app();
        let res = post_form(&app, "/manage/start_new", None, true, "topic=Empty").await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn visitors_without_a_session_see_the_welcome_screen() {
        let app = test_app();
        let body = json_body(get_with(&app, "/", None).await).await;
        assert_eq!(body["phase"], "welcome");
        assert_eq!(body["game_open"], false);

        start_round(&app, "topic=Movies&num_answers=2").await;
        let body = json_body(get_with(&app, "/", None).await).await;
        assert_eq!(body["phase"], "welcome");
        assert_eq!(body["game_open"], true);
    }

    #[tokio::test]
    async fn registering_binds_the_session_to_a_player() {
        let app = test_app();
        start_round(&app, "topic=Movies&num_answers=2").await;

        let cookie = register_player(&app, "alice").await;
        let body = json_body(get_with(&app, "/", Some(&cookie)).await).await;
        assert_eq!(body["phase"], "open_question");
        assert_eq!(body["player"]["name"], "alice");
        assert_eq!(body["player"]["score"], 0);
        assert_eq!(body["submitted"], false);
        assert_eq!(body["decoys"], 0);
        assert_eq!(body["decoys_needed"], 2);
        assert!(body["question"]["text"].as_str().is_some());

        // Registering the same name again rejoins as the same player.
        let rejoin = register_player(&app, "alice").await;
        let body = json_body(get_with(&app, "/", Some(&rejoin)).await).await;
        assert_eq!(body["player"]["name"], "alice");

        let admin = json_body(get_admin(&app, "/manage").await).await;
        assert_eq!(admin["players"], 1);
    }

    #[tokio::test]
    async fn guessing_the_real_answer_leaves_no_trace() {
        let app = test_app();
        start_round(&app, "topic=Movies&num_answers=2").await;
        let cookie = register_player(&app, "alice").await;

        let body = json_body(get_with(&app, "/", Some(&cookie)).await).await;
        let answer = answer_for(body["question"]["text"].as_str().unwrap());

        // Indistinguishable from an accepted submission...
        submit_decoy(&app, &cookie, &answer).await;
        // ...but nothing was stored.
        let admin = json_body(get_admin(&app, "/manage").await).await;
        assert_eq!(admin["decoys"], 0);

        submit_decoy(&app, &cookie, "Titanic2").await;
        let admin = json_body(get_admin(&app, "/manage").await).await;
        assert_eq!(admin["decoys"], 1);
    }

    #[tokio::test]
    async fn full_two_player_round() {
        let app = test_app();
        let started = start_round(&app, "topic=Movies&num_answers=2&seed=42").await;
        let question_id = started["question_id"].as_str().unwrap().to_string();

        let alice = register_player(&app, "alice").await;
        let bob = register_player(&app, "bob").await;

        let poll = json_body(get_with(&app, "/api/cur_question", None).await).await;
        assert_eq!(poll["cur"].as_str(), Some(question_id.as_str()));
        assert_eq!(poll["is_quiz"], false);

        submit_decoy(&app, &alice, "Titanic2").await;
        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "open_question");
        assert_eq!(body["submitted"], true);
        assert_eq!(body["decoys"], 1);

        submit_decoy(&app, &bob, "Titanic3").await;
        let poll = json_body(get_with(&app, "/api/cur_question", None).await).await;
        assert_eq!(poll["is_quiz"], true);

        let quiz = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(quiz["phase"], "quiz");
        assert_eq!(quiz["voted"], false);
        let entries = quiz["entries"].as_array().unwrap().clone();
        assert_eq!(entries.len(), 3);
        let slots: Vec<u64> = entries
            .iter()
            .map(|e| e["slot"].as_u64().unwrap())
            .collect();
        assert_eq!(slots, vec![0, 1, 2]);
        // Authorship never leaks into the quiz.
        assert!(entries.iter().all(|e| e.get("author").is_none()));

        let answer = answer_for(quiz["question"]["text"].as_str().unwrap());
        let truth_slot = entries
            .iter()
            .find(|e| e["text"].as_str() == Some(answer.as_str()))
            .expect("real answer present")["slot"]
            .as_u64()
            .unwrap();
        let alice_slot = entries
            .iter()
            .find(|e| e["text"].as_str() == Some("Titanic2"))
            .unwrap()["slot"]
            .as_u64()
            .unwrap();

        cast_ballot(&app, &alice, &truth_slot.to_string()).await;
        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "quiz");
        assert_eq!(body["voted"], true);
        assert_eq!(body["player"]["score"], 3);

        cast_ballot(&app, &bob, &alice_slot.to_string()).await;
        let body = json_body(get_with(&app, "/", Some(&bob)).await).await;
        assert_eq!(body["phase"], "summary");

        let summary =
            json_body(get_with(&app, &format!("/summary/{question_id}"), None).await).await;
        let entries = summary["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        let truth_entry = entries.iter().find(|e| e["truth"] == true).unwrap();
        assert_eq!(truth_entry["votes"], 1);
        assert!(truth_entry["author"].is_null());
        let alice_entry = entries
            .iter()
            .find(|e| e["text"].as_str() == Some("Titanic2"))
            .unwrap();
        assert_eq!(alice_entry["author"], "alice");
        assert_eq!(alice_entry["votes"], 1);

        let board = summary["scoreboard"].as_array().unwrap();
        assert_eq!(board[0]["name"], "alice");
        assert_eq!(board[0]["score"], 4);
        assert_eq!(board[1]["score"], 0);

        // Viewing the summary advanced the round to a fresh question.
        assert_eq!(summary["ended"], false);
        let next = summary["current"].as_str().expect("next question open");
        assert_ne!(next, question_id);

        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "open_question");
        assert_eq!(body["decoys"], 0);
        assert_eq!(body["question"]["id"].as_str(), Some(next));
    }

    #[tokio::test]
    async fn repeat_ballots_never_double_score() {
        let app = test_app();
        start_round(&app, "topic=Movies&num_answers=1").await;
        let alice = register_player(&app, "alice").await;
        submit_decoy(&app, &alice, "Titanic2").await;

        let quiz = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(quiz["phase"], "quiz");
        let answer = answer_for(quiz["question"]["text"].as_str().unwrap());
        let truth_slot = quiz["entries"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["text"].as_str() == Some(answer.as_str()))
            .unwrap()["slot"]
            .as_u64()
            .unwrap();

        cast_ballot(&app, &alice, &truth_slot.to_string()).await;
        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "summary");
        assert_eq!(body["player"]["score"], 3);

        cast_ballot(&app, &alice, &truth_slot.to_string()).await;
        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["player"]["score"], 3);
    }

    #[tokio::test]
    async fn malformed_ballots_are_discarded() {
        let app = test_app();
        start_round(&app, "topic=Movies&num_answers=1").await;
        let alice = register_player(&app, "alice").await;
        submit_decoy(&app, &alice, "Titanic2").await;

        cast_ballot(&app, &alice, "banana").await;
        cast_ballot(&app, &alice, "99").await;

        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "quiz");
        assert_eq!(body["voted"], false);
        assert_eq!(body["player"]["score"], 0);
    }

    #[tokio::test]
    async fn exhausting_the_pool_ends_the_round() {
        let app = test_app();
        let started = start_round(&app, "topic=Tiny&num_answers=1").await;
        let question_id = started["question_id"].as_str().unwrap().to_string();
        let alice = register_player(&app, "alice").await;

        submit_decoy(&app, &alice, "Maybe").await;
        let quiz = json_body(get_with(&app, "/", Some(&alice)).await).await;
        let truth_slot = quiz["entries"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["text"].as_str() == Some("Yes"))
            .unwrap()["slot"]
            .as_u64()
            .unwrap();
        cast_ballot(&app, &alice, &truth_slot.to_string()).await;

        let summary =
            json_body(get_with(&app, &format!("/summary/{question_id}"), None).await).await;
        assert_eq!(summary["ended"], true);
        assert!(summary["current"].is_null());

        let body = json_body(get_with(&app, "/", Some(&alice)).await).await;
        assert_eq!(body["phase"], "ended");
        assert_eq!(body["scoreboard"][0]["name"], "alice");
        assert_eq!(body["scoreboard"][0]["score"], 3);

        let poll = json_body(get_with(&app, "/api/cur_question", None).await).await;
        assert!(poll["cur"].is_null());
        assert_eq!(poll["is_quiz"], false);
    }

    #[tokio::test]
    async fn operator_can_force_the_next_question() {
        let app = test_app();
        let started = start_round(&app, "topic=Movies&num_answers=2").await;
        let first = started["question_id"].as_str().unwrap().to_string();

        let res = post_form(&app, "/manage/next", None, true, "").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let next = body["current"].as_str().expect("next question open");
        assert_ne!(next, first);
    }

    #[tokio::test]
    async fn persistence_writes_and_reloads_the_registry() {
        let path = std::env::temp_dir().join(format!("psychout_state_{}.json", Uuid::new_v4()));
        let state = AppState::with_persistence(test_topics(), path.clone()).await;
        let app = app(state.clone());

        let started = start_round(&app, "topic=Movies&num_answers=2").await;
        assert!(tokio::fs::metadata(&path).await.is_ok());

        let reloaded = AppState::with_persistence(test_topics(), path.clone()).await;
        let registry = reloaded.registry.read().await;
        assert_eq!(registry.games.len(), 1);
        assert_eq!(registry.active.as_deref(), started["game_id"].as_str());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
