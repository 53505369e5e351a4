//! `Player` backed by an external playback process and the conversation
//! server's TTS endpoint (`{nl_url}/{locale}/voice/tts`). The original
//! desktop host wires this directly to a GStreamer pipeline; this
//! headless daemon shells out to a configurable player binary instead,
//! so it stays usable wherever GStreamer bindings aren't linked in.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};
use vocalis_core::config::SoundsConfig;
use vocalis_core::events::Event;
use vocalis_core::player::{Player, Sound};
use vocalis_core::EventBus;

/// Where to find the bundled local sound effects, mirroring
/// `vocalis_core::models::default_models_dir`'s platform convention for
/// the neighboring asset bundle.
pub fn default_sounds_dir() -> PathBuf {
    vocalis_core::models::default_models_dir()
        .parent()
        .map(|p| p.join("sounds"))
        .unwrap_or_else(|| PathBuf::from("sounds"))
}

pub struct ProcessPlayer {
    bus: EventBus,
    runtime: tokio::runtime::Handle,
    http: reqwest::Client,
    nl_url: String,
    locale: String,
    voice: String,
    sounds_dir: PathBuf,
    sounds: SoundsConfig,
    player_cmd: String,
    current: Arc<Mutex<Option<Child>>>,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
}

impl ProcessPlayer {
    pub fn new(
        bus: EventBus,
        runtime: tokio::runtime::Handle,
        nl_url: String,
        locale: String,
        voice: String,
        sounds_dir: PathBuf,
        sounds: SoundsConfig,
        player_cmd: String,
    ) -> Self {
        Self {
            bus,
            runtime,
            http: reqwest::Client::new(),
            nl_url,
            locale,
            voice,
            sounds_dir,
            sounds,
            player_cmd,
            current: Arc::new(Mutex::new(None)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn sound_path(&self, sound: Sound) -> PathBuf {
        let name = match sound {
            Sound::Wake => &self.sounds.wake,
            Sound::NoInput => &self.sounds.no_input,
            Sound::TooMuchInput => &self.sounds.too_much_input,
            Sound::Working => &self.sounds.working,
            Sound::SttError => &self.sounds.stt_error,
            Sound::NewsIntro => &self.sounds.news_intro,
            Sound::AlarmClockElapsed => &self.sounds.alarm_clock_elapsed,
        };
        self.sounds_dir.join(name)
    }

    /// Kill whatever is currently playing and spawn `path` in its place,
    /// reporting stream lifecycle for `ref_id`-tagged playback.
    fn play_now(&self, path: PathBuf, ref_id: Option<u64>) {
        self.kill_current();

        if let Some(id) = ref_id {
            self.bus.push(Event::PlayerStreamEnter { ref_id: id });
        }

        let child = match Command::new(&self.player_cmd).arg(&path).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(%err, cmd = %self.player_cmd, path = %path.display(), "failed to spawn player process");
                if let Some(id) = ref_id {
                    self.bus.push(Event::PlayerStreamEnd { ref_id: id });
                }
                return;
            }
        };
        *self.current.lock().unwrap() = Some(child);

        let current = self.current.clone();
        let queue = self.queue.clone();
        let bus = self.bus.clone();
        let player_cmd = self.player_cmd.clone();
        std::thread::spawn(move || {
            wait_and_advance(current, queue, bus, player_cmd, ref_id);
        });
    }

    fn kill_current(&self) {
        if let Some(mut child) = self.current.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn fetch_tts(&self, ref_id: u64, text: String) {
        let http = self.http.clone();
        let url = format!("{}/{}/voice/tts", self.nl_url.trim_end_matches('/'), self.locale);
        let voice = self.voice.clone();
        let bus = self.bus.clone();
        let current = self.current.clone();
        let queue = self.queue.clone();
        let player_cmd = self.player_cmd.clone();

        self.runtime.spawn(async move {
            let response = http
                .post(&url)
                .json(&json!({ "text": text, "gender": voice }))
                .send()
                .await;

            let bytes = match response {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "failed to read tts response body");
                        bus.push(Event::PlayerStreamEnd { ref_id });
                        return;
                    }
                },
                Err(err) => {
                    warn!(%err, %url, "tts request failed");
                    bus.push(Event::PlayerStreamEnd { ref_id });
                    return;
                }
            };

            play_downloaded(bytes.to_vec(), "wav", ref_id, bus, current, queue, player_cmd).await;
        });
    }

    fn fetch_url(&self, ref_id: u64, url: String) {
        let http = self.http.clone();
        let bus = self.bus.clone();
        let current = self.current.clone();
        let queue = self.queue.clone();
        let player_cmd = self.player_cmd.clone();
        let extension = Path::new(&url)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("audio")
            .to_string();

        self.runtime.spawn(async move {
            let bytes = match http.get(&url).send().await {
                Ok(resp) => match resp.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, %url, "failed to read streamed audio body");
                        bus.push(Event::PlayerStreamEnd { ref_id });
                        return;
                    }
                },
                Err(err) => {
                    warn!(%err, %url, "audio url request failed");
                    bus.push(Event::PlayerStreamEnd { ref_id });
                    return;
                }
            };
            play_downloaded(bytes.to_vec(), &extension, ref_id, bus, current, queue, player_cmd).await;
        });
    }
}

async fn play_downloaded(
    data: Vec<u8>,
    extension: &str,
    ref_id: u64,
    bus: EventBus,
    current: Arc<Mutex<Option<Child>>>,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    player_cmd: String,
) {
    let path = std::env::temp_dir().join(format!("vocalis-stream-{ref_id}.{extension}"));
    if let Err(err) = tokio::fs::write(&path, &data).await {
        warn!(%err, path = %path.display(), "failed to buffer downloaded audio to disk");
        bus.push(Event::PlayerStreamEnd { ref_id });
        return;
    }

    if let Some(mut child) = current.lock().unwrap().take() {
        let _ = child.kill();
        let _ = child.wait();
    }

    bus.push(Event::PlayerStreamEnter { ref_id });
    let child = match Command::new(&player_cmd).arg(&path).spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(%err, cmd = %player_cmd, "failed to spawn player process");
            bus.push(Event::PlayerStreamEnd { ref_id });
            return;
        }
    };
    *current.lock().unwrap() = Some(child);

    std::thread::spawn(move || {
        wait_and_advance(current, queue, bus, player_cmd, Some(ref_id));
    });
}

/// Blocks on the just-spawned child, then either reports stream end
/// (`ref_id`-tagged playback) or pops and plays the next queued sound.
fn wait_and_advance(
    current: Arc<Mutex<Option<Child>>>,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    bus: EventBus,
    player_cmd: String,
    ref_id: Option<u64>,
) {
    let handle = current.lock().unwrap().take();
    if let Some(mut child) = handle {
        let _ = child.wait();
    }

    if let Some(id) = ref_id {
        bus.push(Event::PlayerStreamEnd { ref_id: id });
    }

    let next = queue.lock().unwrap().pop_front();
    if let Some(path) = next {
        match Command::new(&player_cmd).arg(&path).spawn() {
            Ok(child) => {
                *current.lock().unwrap() = Some(child);
                wait_and_advance(current, queue, bus, player_cmd, None);
            }
            Err(err) => warn!(%err, cmd = %player_cmd, "failed to spawn queued player process"),
        }
    }
}

impl Player for ProcessPlayer {
    fn say(&mut self, ref_id: u64, text: &str) {
        if text.is_empty() {
            return;
        }
        debug!(ref_id, "saying");
        self.fetch_tts(ref_id, text.to_string());
    }

    fn play_url(&mut self, ref_id: u64, url: &str) {
        debug!(ref_id, url, "playing remote url");
        self.fetch_url(ref_id, url.to_string());
    }

    fn play_sound(&mut self, sound: Sound, queue: bool) {
        let path = self.sound_path(sound);
        if queue && self.current.lock().unwrap().is_some() {
            self.queue.lock().unwrap().push_back(path);
            return;
        }
        self.play_now(path, None);
    }

    fn stop(&mut self) {
        self.kill_current();
    }

    fn resume(&mut self) {
        // The process-backed player has no paused state to resume from —
        // `stop` always kills the child outright rather than pausing it.
    }

    fn clean_queue(&mut self) {
        self.queue.lock().unwrap().clear();
    }
}
