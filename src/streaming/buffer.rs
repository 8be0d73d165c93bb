//! Stream-Puffer
//!
//! FIFO aus Audio-Paketen mit Byte-Grenzen. `size <= max_size` gilt immer:
//! passt ein Paket nicht, werden vorne die ältesten Pakete verdrängt, und
//! jede solche Verdrängung wird gezählt.
//!
//! Die Freigabe bei `target_size` behält eine Reserve von `min_size` Bytes,
//! erst der Flush-Timer leert den Puffer ganz.

use crate::audio::AudioPacket;
use std::collections::VecDeque;

/// Ergebnis einer Aufnahme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Aufgenommen, nachdem `evicted` alte Pakete verdrängt wurden
    QueuedAfterEviction { evicted: usize },
    /// Paket größer als `max_size`, verworfen nachdem der Puffer geleert wurde
    Oversized { evicted: usize },
}

impl Admission {
    pub fn evicted(&self) -> usize {
        match self {
            Admission::Queued => 0,
            Admission::QueuedAfterEviction { evicted } | Admission::Oversized { evicted } => {
                *evicted
            }
        }
    }

    pub fn is_overflow(&self) -> bool {
        !matches!(self, Admission::Queued)
    }
}

#[derive(Debug, Clone)]
pub struct StreamBuffer {
    packets: VecDeque<AudioPacket>,
    size: usize,
    min_size: usize,
    max_size: usize,
    target_size: usize,
    /// Konfigurierte Werte, `resize` skaliert sie mit
    base_min: usize,
    base_target: usize,
    base_max: usize,
    overflow_count: u64,
    evicted_packets: u64,
    oversized_drops: u64,
}

impl StreamBuffer {
    pub fn new(min_size: usize, target_size: usize, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        let target_size = target_size.min(max_size);
        Self {
            packets: VecDeque::new(),
            size: 0,
            min_size: min_size.min(target_size),
            max_size,
            target_size,
            base_min: min_size.min(target_size),
            base_target: target_size,
            base_max: max_size,
            overflow_count: 0,
            evicted_packets: 0,
            oversized_drops: 0,
        }
    }

    /// Hängt ein Paket an und verdrängt bei Bedarf die ältesten
    pub fn push(&mut self, packet: AudioPacket) -> Admission {
        let len = packet.len();
        let mut evicted = 0;

        while self.size + len > self.max_size {
            match self.packets.pop_front() {
                Some(old) => {
                    self.size -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }

        if self.size + len > self.max_size {
            self.overflow_count += 1;
            self.evicted_packets += evicted as u64;
            self.oversized_drops += 1;
            return Admission::Oversized { evicted };
        }

        self.size += len;
        self.packets.push_back(packet);

        if evicted > 0 {
            self.overflow_count += 1;
            self.evicted_packets += evicted as u64;
            Admission::QueuedAfterEviction { evicted }
        } else {
            Admission::Queued
        }
    }

    /// Ob genug gepuffert ist, um freizugeben
    pub fn is_ready(&self) -> bool {
        !self.packets.is_empty() && self.size >= self.target_size
    }

    /// Gibt die ältesten Pakete frei, sobald `target_size` erreicht ist
    ///
    /// Es bleiben mindestens `min_size` Bytes im Puffer.
    pub fn release_ready(&mut self) -> Vec<AudioPacket> {
        let mut released = Vec::new();
        if !self.is_ready() {
            return released;
        }
        while let Some(front) = self.packets.front() {
            if self.size - front.len() < self.min_size {
                break;
            }
            self.size -= front.len();
            if let Some(packet) = self.packets.pop_front() {
                released.push(packet);
            }
        }
        released
    }

    /// Gibt unabhängig vom Füllstand alles frei
    pub fn flush(&mut self) -> Vec<AudioPacket> {
        self.size = 0;
        self.packets.drain(..).collect()
    }

    pub fn is_below_min(&self) -> bool {
        self.size < self.min_size
    }

    /// Setzt eine neue Obergrenze; `target`/`min` wachsen und schrumpfen
    /// im selben Verhältnis
    ///
    /// Gibt die Anzahl verdrängter Pakete zurück.
    pub fn resize(&mut self, max_size: usize) -> usize {
        self.max_size = max_size.max(1);
        let ratio = self.max_size as f64 / self.base_max as f64;
        self.target_size = ((self.base_target as f64 * ratio) as usize).min(self.max_size);
        self.min_size = ((self.base_min as f64 * ratio) as usize).min(self.target_size);

        let mut evicted = 0;
        while self.size > self.max_size {
            match self.packets.pop_front() {
                Some(old) => {
                    self.size -= old.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.overflow_count += 1;
            self.evicted_packets += evicted as u64;
        }
        evicted
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Anzahl der Verdrängungs-Batches
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn evicted_packets(&self) -> u64 {
        self.evicted_packets
    }

    pub fn oversized_drops(&self) -> u64 {
        self.oversized_drops
    }
}
