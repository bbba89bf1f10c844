//! Seek engine (C10).
//!
//! Rewinds to the seek origin captured when `ClassInfo` was consumed,
//! replays signon state silently, then fast-forwards to a target game
//! time by watching `CDOTAGamerulesProxy.m_pGameRules.m_fGameTime`.

use tracing::{instrument, trace};

use crate::decoders::PropertyValue;
use crate::driver::{DriverState, Observer, SilentObserver, StreamDriver};
use crate::entity::find_field_by_name;
use crate::error::{Error, Result};
use crate::framing::PacketKind;

/// Switch from coarse replay to single-packet stepping once within this
/// many seconds of the target, to avoid overshooting it (§4.10 step 5).
const FINE_GRAINED_WINDOW_SECONDS: f32 = 61.0;

const GAMERULES_CLASS: &str = "CDOTAGamerulesProxy";
const GAME_TIME_PATH: [&str; 2] = ["m_pGameRules", "m_fGameTime"];

impl<'a> StreamDriver<'a> {
    /// Seek to game time `target`, replaying silently until the target is
    /// reached (or closely approached) and then resuming normal dispatch
    /// through `observer`.
    #[instrument(skip(self, observer))]
    pub fn seek(&mut self, target: f32, observer: &mut dyn Observer) -> Result<()> {
        let origin = self.seek_origin.ok_or(Error::StateViolation(
            "seek attempted before SENDTABLES state",
        ))?;

        self.entities.reset();
        for table in self.string_tables.values_mut() {
            table.clear();
        }
        self.cursor.seek_to(origin);
        self.tick = 0;
        self.state = DriverState::SendTables;

        let mut silent = SilentObserver;
        self.prime(&mut silent)?;
        self.fast_forward(target, &mut silent)?;

        // Re-dispatch the state transition to the real observer now that
        // normal playback resumes; the priming phase above ran silently.
        self.set_state(DriverState::Running, observer);
        Ok(())
    }

    /// Step through packets, restoring string tables from each `FullPacket`
    /// snapshot, until at least one entity has been created (§4.10 step 3).
    fn prime(&mut self, silent: &mut dyn Observer) -> Result<()> {
        loop {
            let Some(packet) = self.cursor.next_packet(self.decompressor.as_ref())? else {
                return Err(Error::SeekOverflow);
            };
            match packet.kind {
                PacketKind::Stop => return Err(Error::SeekOverflow),
                PacketKind::FullPacket => {
                    let full = self.messages.decode_full_packet(&packet.data)?;
                    self.restore_string_tables(full.string_tables);
                    self.dispatch_inner(&full.packet_data, silent)?;
                }
                PacketKind::Packet | PacketKind::SignonPacket => {
                    self.dispatch_inner(&packet.data, silent)?;
                }
                _ => {}
            }
            if self.entities.find_by_class_name(GAMERULES_CLASS).is_some() {
                return Ok(());
            }
        }
    }

    /// Parse forward, without dispatching to the real observer, until the
    /// gamerules clock reaches `target`. Every iteration steps exactly one
    /// outer packet and re-checks game time, which already gives the
    /// fine-grained, overshoot-proof stepping called for inside the
    /// [`FINE_GRAINED_WINDOW_SECONDS`] window; outside it the same stepping
    /// just runs without the caller needing to think about the distinction.
    fn fast_forward(&mut self, target: f32, silent: &mut dyn Observer) -> Result<()> {
        let mut entered_fine_window = false;
        loop {
            let Some(time) = self.current_game_time() else {
                return Err(Error::SeekNoGamerules);
            };
            if time >= target {
                return Ok(());
            }
            if !entered_fine_window && target - time <= FINE_GRAINED_WINDOW_SECONDS {
                entered_fine_window = true;
                trace!(target, time, "seek entering fine-grained stepping window");
            }

            let Some(packet) = self.cursor.next_packet(self.decompressor.as_ref())? else {
                return Err(Error::SeekOverflow);
            };
            match packet.kind {
                PacketKind::Stop => return Err(Error::SeekOverflow),
                PacketKind::FullPacket => {
                    let full = self.messages.decode_full_packet(&packet.data)?;
                    self.restore_string_tables(full.string_tables);
                    self.dispatch_inner(&full.packet_data, silent)?;
                }
                PacketKind::Packet | PacketKind::SignonPacket => {
                    self.dispatch_inner(&packet.data, silent)?;
                }
                _ => {}
            }
        }
    }

    fn current_game_time(&self) -> Option<f32> {
        let (entity, root) = self.entities.find_by_class_name(GAMERULES_CLASS)?;
        match find_field_by_name(entity, &self.schema.as_ref()?.arena, root, &GAME_TIME_PATH) {
            Some(PropertyValue::F32(t)) => Some(*t),
            _ => None,
        }
    }
}
